//! Generic persistence abstraction.
//!
//! Every higher component goes through `Repository<T>` for single-entity
//! operations and `Transactional<T>` when several writes must commit or
//! roll back as one unit. Backends: `memory` (tests, embedded use) and
//! `postgres` (production).

pub mod memory;
pub mod postgres;

use crate::errors::AuthError;
use async_trait::async_trait;
use std::future::Future;
use std::hash::Hash;
use std::time::Duration;

/// A persistable entity with an identity key and a composable filter spec.
pub trait Entity: Clone + Send + Sync + 'static {
    type Id: Clone + Eq + Hash + Send + Sync;
    type Filter: Clone + Send + Sync;

    fn id(&self) -> Self::Id;

    /// Storage-agnostic predicate evaluation; backends may translate the
    /// filter to native queries instead of calling this.
    fn matches(&self, filter: &Self::Filter) -> bool;

    /// True when two distinct entities violate a uniqueness constraint.
    fn conflicts_with(&self, other: &Self) -> bool;

    /// Optimistic-concurrency token.
    fn version(&self) -> i64;
    fn set_version(&mut self, version: i64);
}

/// Uniform CRUD + query contract over an entity type.
///
/// All operations are atomic at the single-entity level.
#[async_trait]
pub trait Repository<T: Entity>: Send + Sync {
    /// `None` if absent; absence is not an error.
    async fn get(&self, id: &T::Id) -> Result<Option<T>, AuthError>;

    async fn find(&self, filter: &T::Filter) -> Result<Vec<T>, AuthError>;

    /// Fails with `Conflict` if a uniqueness constraint is violated.
    async fn add(&self, entity: T) -> Result<T, AuthError>;

    /// Fails with `NotFound` if the id is absent and `Conflict` if the
    /// entity's version no longer matches the stored one.
    async fn update(&self, entity: T) -> Result<T, AuthError>;

    /// Idempotent; absent ids are not an error.
    async fn remove(&self, id: &T::Id) -> Result<(), AuthError>;
}

/// Scoped transaction over one entity type.
///
/// Writes are staged until `commit`; dropping a unit of work without
/// committing rolls everything back, on every exit path.
#[async_trait]
pub trait UnitOfWork<T: Entity>: Send {
    async fn get(&mut self, id: &T::Id) -> Result<Option<T>, AuthError>;

    async fn find(&mut self, filter: &T::Filter) -> Result<Vec<T>, AuthError>;

    async fn add(&mut self, entity: T) -> Result<T, AuthError>;

    async fn update(&mut self, entity: T) -> Result<T, AuthError>;

    async fn commit(self) -> Result<(), AuthError>
    where
        Self: Sized;
}

/// A repository that can hand out scoped units of work.
#[async_trait]
pub trait Transactional<T: Entity>: Repository<T> {
    type Uow: UnitOfWork<T>;

    async fn begin(&self) -> Result<Self::Uow, AuthError>;
}

/// Run a store operation under a caller-supplied deadline.
///
/// On timeout the operation surfaces as `StoreUnavailable`; backends
/// guarantee no partial writes (the underlying transaction rolls back).
pub async fn with_deadline<T, F>(deadline: Duration, fut: F) -> Result<T, AuthError>
where
    F: Future<Output = Result<T, AuthError>> + Send,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(AuthError::StoreUnavailable(format!(
            "operation exceeded deadline of {:?}",
            deadline
        ))),
    }
}

const RETRY_INITIAL_BACKOFF_MS: u64 = 100;
const RETRY_MAX_BACKOFF_MS: u64 = 1_000;

/// Retry a transient-failure-prone operation with bounded exponential
/// backoff. Only `StoreUnavailable` is retried; every other error
/// propagates unchanged on the first occurrence.
pub async fn with_backoff<T, F, Fut>(max_attempts: u32, mut op: F) -> Result<T, AuthError>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<T, AuthError>> + Send,
{
    let mut backoff = RETRY_INITIAL_BACKOFF_MS;
    let mut attempt = 1;

    loop {
        match op().await {
            Err(AuthError::StoreUnavailable(reason)) if attempt < max_attempts => {
                tracing::warn!(
                    attempt,
                    max_attempts,
                    %reason,
                    "transient store failure, retrying after backoff"
                );
                tokio::time::sleep(Duration::from_millis(backoff)).await;
                backoff = (backoff * 2).min(RETRY_MAX_BACKOFF_MS);
                attempt += 1;
            }
            other => return other,
        }
    }
}
