//! Postgres store backend.
//!
//! Per-entity `Repository` implementations over a `PgPool`. Uniqueness is
//! enforced by constraints (unique-violation maps to `Conflict`), optimistic
//! concurrency by a version column guarded in every `UPDATE`. The refresh
//! token store exposes a `sqlx::Transaction`-backed unit of work; rows read
//! inside it are locked (`FOR UPDATE`) so rotation of a given token is
//! linearizable across connections.

use crate::errors::AuthError;
use crate::models::{RefreshToken, RefreshTokenFilter, User, UserFilter};
use crate::store::{self, Repository, Transactional, UnitOfWork};
use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use std::time::Duration;
use uuid::Uuid;

const READ_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(5);

const PG_UNIQUE_VIOLATION: &str = "23505";

const USER_COLUMNS: &str = "user_id, username, email, password_hash, hash_algorithm, \
     roles, is_active, failed_logins, locked_until, created_at, version";

const TOKEN_COLUMNS: &str =
    "token_id, user_id, issued_at, expires_at, revoked, replaced_by, version";

/// Map a sqlx error into the service taxonomy.
fn map_sqlx_err(e: sqlx::Error) -> AuthError {
    match &e {
        sqlx::Error::Database(db) if db.code().as_deref() == Some(PG_UNIQUE_VIOLATION) => {
            AuthError::Conflict("uniqueness constraint violated".to_string())
        }
        _ => AuthError::StoreUnavailable(format!("database error: {}", e)),
    }
}

#[derive(Clone)]
pub struct PgUserStore {
    pool: PgPool,
    op_timeout: Duration,
}

impl PgUserStore {
    pub fn new(pool: PgPool) -> Self {
        PgUserStore {
            pool,
            op_timeout: DEFAULT_OP_TIMEOUT,
        }
    }

    pub fn with_op_timeout(mut self, op_timeout: Duration) -> Self {
        self.op_timeout = op_timeout;
        self
    }
}

#[async_trait]
impl Repository<User> for PgUserStore {
    async fn get(&self, id: &Uuid) -> Result<Option<User>, AuthError> {
        let query = format!("SELECT {} FROM users WHERE user_id = $1", USER_COLUMNS);
        store::with_backoff(READ_RETRY_ATTEMPTS, || {
            store::with_deadline(self.op_timeout, async {
                sqlx::query_as::<_, User>(&query)
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(map_sqlx_err)
            })
        })
        .await
    }

    async fn find(&self, filter: &UserFilter) -> Result<Vec<User>, AuthError> {
        store::with_backoff(READ_RETRY_ATTEMPTS, || {
            store::with_deadline(self.op_timeout, async {
                let mut qb: QueryBuilder<Postgres> =
                    QueryBuilder::new(format!("SELECT {} FROM users WHERE TRUE", USER_COLUMNS));
                if let Some(needle) = &filter.username_or_email {
                    qb.push(" AND (LOWER(username) = LOWER(")
                        .push_bind(needle.clone())
                        .push(") OR LOWER(email) = LOWER(")
                        .push_bind(needle.clone())
                        .push("))");
                }
                qb.build_query_as::<User>()
                    .fetch_all(&self.pool)
                    .await
                    .map_err(map_sqlx_err)
            })
        })
        .await
    }

    async fn add(&self, entity: User) -> Result<User, AuthError> {
        let query = format!(
            "INSERT INTO users ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 1) \
             RETURNING {}",
            USER_COLUMNS, USER_COLUMNS
        );
        store::with_deadline(self.op_timeout, async {
            sqlx::query_as::<_, User>(&query)
                .bind(entity.user_id)
                .bind(&entity.username)
                .bind(&entity.email)
                .bind(&entity.password_hash)
                .bind(&entity.hash_algorithm)
                .bind(&entity.roles)
                .bind(entity.is_active)
                .bind(entity.failed_logins)
                .bind(entity.locked_until)
                .bind(entity.created_at)
                .fetch_one(&self.pool)
                .await
                .map_err(map_sqlx_err)
        })
        .await
    }

    async fn update(&self, entity: User) -> Result<User, AuthError> {
        let query = format!(
            "UPDATE users SET username = $2, email = $3, password_hash = $4, \
             hash_algorithm = $5, roles = $6, is_active = $7, failed_logins = $8, \
             locked_until = $9, version = version + 1 \
             WHERE user_id = $1 AND version = $10 RETURNING {}",
            USER_COLUMNS
        );
        let updated = store::with_deadline(self.op_timeout, async {
            sqlx::query_as::<_, User>(&query)
                .bind(entity.user_id)
                .bind(&entity.username)
                .bind(&entity.email)
                .bind(&entity.password_hash)
                .bind(&entity.hash_algorithm)
                .bind(&entity.roles)
                .bind(entity.is_active)
                .bind(entity.failed_logins)
                .bind(entity.locked_until)
                .bind(entity.version)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx_err)
        })
        .await?;

        match updated {
            Some(user) => Ok(user),
            // Zero rows: either the id is gone or the version moved on.
            None => match self.get(&entity.user_id).await? {
                Some(_) => Err(AuthError::Conflict(
                    "concurrent modification detected".to_string(),
                )),
                None => Err(AuthError::NotFound("user does not exist".to_string())),
            },
        }
    }

    async fn remove(&self, id: &Uuid) -> Result<(), AuthError> {
        store::with_deadline(self.op_timeout, async {
            sqlx::query("DELETE FROM users WHERE user_id = $1")
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_err)?;
            Ok(())
        })
        .await
    }
}

#[derive(Clone)]
pub struct PgRefreshTokenStore {
    pool: PgPool,
    op_timeout: Duration,
}

impl PgRefreshTokenStore {
    pub fn new(pool: PgPool) -> Self {
        PgRefreshTokenStore {
            pool,
            op_timeout: DEFAULT_OP_TIMEOUT,
        }
    }

    pub fn with_op_timeout(mut self, op_timeout: Duration) -> Self {
        self.op_timeout = op_timeout;
        self
    }
}

fn push_token_filter(qb: &mut QueryBuilder<Postgres>, filter: &RefreshTokenFilter) {
    if let Some(user_id) = filter.user_id {
        qb.push(" AND user_id = ").push_bind(user_id);
    }
    if let Some(replaced_by) = &filter.replaced_by {
        qb.push(" AND replaced_by = ").push_bind(replaced_by.clone());
    }
    if filter.unrevoked_only {
        qb.push(" AND revoked = FALSE");
    }
}

#[async_trait]
impl Repository<RefreshToken> for PgRefreshTokenStore {
    async fn get(&self, id: &String) -> Result<Option<RefreshToken>, AuthError> {
        let query = format!(
            "SELECT {} FROM refresh_tokens WHERE token_id = $1",
            TOKEN_COLUMNS
        );
        store::with_backoff(READ_RETRY_ATTEMPTS, || {
            store::with_deadline(self.op_timeout, async {
                sqlx::query_as::<_, RefreshToken>(&query)
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(map_sqlx_err)
            })
        })
        .await
    }

    async fn find(&self, filter: &RefreshTokenFilter) -> Result<Vec<RefreshToken>, AuthError> {
        store::with_backoff(READ_RETRY_ATTEMPTS, || {
            store::with_deadline(self.op_timeout, async {
                let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                    "SELECT {} FROM refresh_tokens WHERE TRUE",
                    TOKEN_COLUMNS
                ));
                push_token_filter(&mut qb, filter);
                qb.build_query_as::<RefreshToken>()
                    .fetch_all(&self.pool)
                    .await
                    .map_err(map_sqlx_err)
            })
        })
        .await
    }

    async fn add(&self, entity: RefreshToken) -> Result<RefreshToken, AuthError> {
        let query = format!(
            "INSERT INTO refresh_tokens ({}) VALUES ($1, $2, $3, $4, $5, $6, 1) RETURNING {}",
            TOKEN_COLUMNS, TOKEN_COLUMNS
        );
        store::with_deadline(self.op_timeout, async {
            sqlx::query_as::<_, RefreshToken>(&query)
                .bind(&entity.token_id)
                .bind(entity.user_id)
                .bind(entity.issued_at)
                .bind(entity.expires_at)
                .bind(entity.revoked)
                .bind(&entity.replaced_by)
                .fetch_one(&self.pool)
                .await
                .map_err(map_sqlx_err)
        })
        .await
    }

    async fn update(&self, entity: RefreshToken) -> Result<RefreshToken, AuthError> {
        let query = format!(
            "UPDATE refresh_tokens SET revoked = $2, replaced_by = $3, version = version + 1 \
             WHERE token_id = $1 AND version = $4 RETURNING {}",
            TOKEN_COLUMNS
        );
        let updated = store::with_deadline(self.op_timeout, async {
            sqlx::query_as::<_, RefreshToken>(&query)
                .bind(&entity.token_id)
                .bind(entity.revoked)
                .bind(&entity.replaced_by)
                .bind(entity.version)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx_err)
        })
        .await?;

        match updated {
            Some(token) => Ok(token),
            None => match self.get(&entity.token_id).await? {
                Some(_) => Err(AuthError::Conflict(
                    "concurrent modification detected".to_string(),
                )),
                None => Err(AuthError::NotFound(
                    "refresh token does not exist".to_string(),
                )),
            },
        }
    }

    async fn remove(&self, id: &String) -> Result<(), AuthError> {
        store::with_deadline(self.op_timeout, async {
            sqlx::query("DELETE FROM refresh_tokens WHERE token_id = $1")
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_err)?;
            Ok(())
        })
        .await
    }
}

/// Unit of work over refresh tokens backed by a database transaction.
///
/// Dropping without commit rolls back (sqlx transaction drop semantics).
pub struct PgRefreshTokenUow {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl UnitOfWork<RefreshToken> for PgRefreshTokenUow {
    async fn get(&mut self, id: &String) -> Result<Option<RefreshToken>, AuthError> {
        // Row-lock so a concurrent rotation of the same token blocks until
        // this transaction resolves.
        let query = format!(
            "SELECT {} FROM refresh_tokens WHERE token_id = $1 FOR UPDATE",
            TOKEN_COLUMNS
        );
        sqlx::query_as::<_, RefreshToken>(&query)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx_err)
    }

    async fn find(&mut self, filter: &RefreshTokenFilter) -> Result<Vec<RefreshToken>, AuthError> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {} FROM refresh_tokens WHERE TRUE",
            TOKEN_COLUMNS
        ));
        push_token_filter(&mut qb, filter);
        qb.push(" FOR UPDATE");
        qb.build_query_as::<RefreshToken>()
            .fetch_all(&mut *self.tx)
            .await
            .map_err(map_sqlx_err)
    }

    async fn add(&mut self, entity: RefreshToken) -> Result<RefreshToken, AuthError> {
        let query = format!(
            "INSERT INTO refresh_tokens ({}) VALUES ($1, $2, $3, $4, $5, $6, 1) RETURNING {}",
            TOKEN_COLUMNS, TOKEN_COLUMNS
        );
        sqlx::query_as::<_, RefreshToken>(&query)
            .bind(&entity.token_id)
            .bind(entity.user_id)
            .bind(entity.issued_at)
            .bind(entity.expires_at)
            .bind(entity.revoked)
            .bind(&entity.replaced_by)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(map_sqlx_err)
    }

    async fn update(&mut self, entity: RefreshToken) -> Result<RefreshToken, AuthError> {
        let query = format!(
            "UPDATE refresh_tokens SET revoked = $2, replaced_by = $3, version = version + 1 \
             WHERE token_id = $1 AND version = $4 RETURNING {}",
            TOKEN_COLUMNS
        );
        let updated = sqlx::query_as::<_, RefreshToken>(&query)
            .bind(&entity.token_id)
            .bind(entity.revoked)
            .bind(&entity.replaced_by)
            .bind(entity.version)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx_err)?;

        match updated {
            Some(token) => Ok(token),
            None => match self.get(&entity.token_id).await? {
                Some(_) => Err(AuthError::Conflict(
                    "concurrent modification detected".to_string(),
                )),
                None => Err(AuthError::NotFound(
                    "refresh token does not exist".to_string(),
                )),
            },
        }
    }

    async fn commit(self) -> Result<(), AuthError> {
        self.tx.commit().await.map_err(map_sqlx_err)
    }
}

#[async_trait]
impl Transactional<RefreshToken> for PgRefreshTokenStore {
    type Uow = PgRefreshTokenUow;

    async fn begin(&self) -> Result<PgRefreshTokenUow, AuthError> {
        let tx = self.pool.begin().await.map_err(map_sqlx_err)?;
        Ok(PgRefreshTokenUow { tx })
    }
}
