//! Auth service library.
//!
//! Token lifecycle engine (issuance, validation, refresh rotation with
//! reuse detection, revocation) over a generic persistence abstraction,
//! plus the credential store and the orchestrator the HTTP layer calls.
//!
//! # Modules
//!
//! - `config` - Service configuration, validated at startup
//! - `errors` - Error taxonomy and HTTP status mapping
//! - `handlers` - HTTP request handlers (thin glue)
//! - `models` - Data models (`User`, `RefreshToken`, claims)
//! - `routes` - Route wiring
//! - `services` - Credential store, token service, auth orchestrator
//! - `store` - Generic repository/unit-of-work with memory and Postgres backends

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod store;
