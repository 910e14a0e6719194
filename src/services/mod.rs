//! Business logic layer.

pub mod auth_service;
pub mod credential_store;
pub mod token_service;
