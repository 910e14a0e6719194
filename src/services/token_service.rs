//! Token service: access-token signing/validation and refresh rotation.
//!
//! Access tokens are stateless HS256 JWTs; validity is signature + expiry,
//! no store lookup. Refresh tokens are stateful rows rotated on every use
//! and linked through `replaced_by`. Presenting a rotated or revoked token
//! is treated as a compromise signal: the whole chain is revoked before the
//! error surfaces.

use crate::config::Config;
use crate::errors::AuthError;
use crate::models::{AccessClaims, RefreshToken, RefreshTokenFilter, TokenPair, TokenState, User};
use crate::services::credential_store::SessionRevoker;
use crate::store::{Repository, Transactional, UnitOfWork};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, decode_header, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use ring::rand::{SecureRandom, SystemRandom};
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

const REFRESH_TOKEN_ID_BYTES: usize = 32;
const TOKEN_TYPE_ACCESS: &str = "access";
/// Upper bound on chain walks; a longer chain indicates corrupted links.
const MAX_CHAIN_LENGTH: usize = 10_000;

#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
    pub issuer: String,
    pub audience: String,
    /// How long the previous signing key keeps validating after rotation.
    pub rotation_grace: Duration,
}

impl TokenConfig {
    pub fn from_config(config: &Config) -> Self {
        TokenConfig {
            access_ttl: Duration::seconds(config.access_token_ttl_secs),
            refresh_ttl: Duration::seconds(config.refresh_token_ttl_secs),
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
            rotation_grace: Duration::seconds(config.key_rotation_grace_secs),
        }
    }
}

#[derive(Clone)]
struct KeyEntry {
    kid: String,
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl KeyEntry {
    fn new(kid: &str, material: &[u8]) -> Self {
        KeyEntry {
            kid: kid.to_string(),
            encoding: EncodingKey::from_secret(material),
            decoding: DecodingKey::from_secret(material),
        }
    }
}

/// Immutable key-set snapshot. Rotation swaps the whole snapshot so readers
/// always observe either the old or the new set, never a torn value.
struct KeySnapshot {
    active: KeyEntry,
    previous: Option<RetiredKey>,
}

struct RetiredKey {
    key: KeyEntry,
    retired_at: DateTime<Utc>,
}

pub struct TokenService<S, R> {
    tokens: S,
    users: R,
    keys: RwLock<Arc<KeySnapshot>>,
    config: TokenConfig,
    rng: SystemRandom,
}

impl<S, R> TokenService<S, R>
where
    S: Transactional<RefreshToken>,
    R: Repository<User>,
{
    pub fn new(tokens: S, users: R, key_material: &[u8], key_id: &str, config: TokenConfig) -> Self {
        TokenService {
            tokens,
            users,
            keys: RwLock::new(Arc::new(KeySnapshot {
                active: KeyEntry::new(key_id, key_material),
                previous: None,
            })),
            config,
            rng: SystemRandom::new(),
        }
    }

    fn key_snapshot(&self) -> Arc<KeySnapshot> {
        Arc::clone(&self.keys.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Install a new active signing key. The outgoing key stays valid for
    /// the configured grace window so in-flight access tokens survive until
    /// their natural expiry.
    pub fn rotate_signing_key(&self, key_material: &[u8], key_id: &str) {
        let next = KeyEntry::new(key_id, key_material);
        let mut guard = self.keys.write().unwrap_or_else(|e| e.into_inner());
        let retiring = guard.active.clone();
        *guard = Arc::new(KeySnapshot {
            active: next,
            previous: Some(RetiredKey {
                key: retiring,
                retired_at: Utc::now(),
            }),
        });
        drop(guard);
        tracing::info!(key_id, "signing key rotated");
    }

    fn new_token_id(&self) -> Result<String, AuthError> {
        let mut bytes = [0u8; REFRESH_TOKEN_ID_BYTES];
        self.rng
            .fill(&mut bytes)
            .map_err(|_| AuthError::StoreUnavailable("rng unavailable".to_string()))?;
        Ok(general_purpose::URL_SAFE_NO_PAD.encode(bytes))
    }

    fn mint_refresh(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<RefreshToken, AuthError> {
        Ok(RefreshToken {
            token_id: self.new_token_id()?,
            user_id,
            issued_at: now,
            expires_at: now + self.config.refresh_ttl,
            revoked: false,
            replaced_by: None,
            version: 0,
        })
    }

    fn sign_access_token(&self, user: &User, now: DateTime<Utc>) -> Result<String, AuthError> {
        let snapshot = self.key_snapshot();
        let claims = AccessClaims {
            sub: user.user_id,
            iss: self.config.issuer.clone(),
            aud: self.config.audience.clone(),
            iat: now.timestamp(),
            exp: (now + self.config.access_ttl).timestamp(),
            roles: user.roles.clone(),
            typ: TOKEN_TYPE_ACCESS.to_string(),
        };

        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some(snapshot.active.kid.clone());

        encode(&header, &claims, &snapshot.active.encoding)
            .map_err(|e| AuthError::StoreUnavailable(format!("failed to sign access token: {}", e)))
    }

    fn build_pair(&self, user: &User, refresh: &RefreshToken, now: DateTime<Utc>) -> Result<TokenPair, AuthError> {
        Ok(TokenPair {
            access_token: self.sign_access_token(user, now)?,
            token_type: "Bearer".to_string(),
            expires_in: self.config.access_ttl.num_seconds().max(0) as u64,
            refresh_token: refresh.token_id.clone(),
            refresh_expires_at: refresh.expires_at,
        })
    }

    /// Mint a fresh access/refresh pair for a verified user.
    ///
    /// Only called after successful credential verification or rotation.
    pub async fn issue_token_pair(&self, user: &User) -> Result<TokenPair, AuthError> {
        let now = Utc::now();
        let refresh = self.mint_refresh(user.user_id, now)?;
        let refresh = self.tokens.add(refresh).await?;
        self.build_pair(user, &refresh, now)
    }

    /// Validate an access token: signature, expiry, issuer, audience and
    /// token-type claim. Pure and stateless; no store access.
    pub fn validate_access_token(&self, token: &str) -> Result<AccessClaims, AuthError> {
        let header =
            decode_header(token).map_err(|e| AuthError::TokenInvalid(e.to_string()))?;
        let kid = header
            .kid
            .ok_or_else(|| AuthError::TokenInvalid("missing key id".to_string()))?;

        let snapshot = self.key_snapshot();
        let decoding_key = if kid == snapshot.active.kid {
            &snapshot.active.decoding
        } else {
            match &snapshot.previous {
                Some(retired)
                    if retired.key.kid == kid
                        && Utc::now() <= retired.retired_at + self.config.rotation_grace =>
                {
                    &retired.key.decoding
                }
                _ => {
                    return Err(AuthError::TokenInvalid(
                        "unknown or retired signing key".to_string(),
                    ))
                }
            }
        };

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.config.issuer]);
        validation.set_audience(&[&self.config.audience]);
        validation.leeway = 0;

        let data = decode::<AccessClaims>(token, decoding_key, &validation).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::TokenInvalid(e.to_string()),
            }
        })?;

        if data.claims.typ != TOKEN_TYPE_ACCESS {
            return Err(AuthError::TokenInvalid("wrong token type".to_string()));
        }

        Ok(data.claims)
    }

    /// Rotate a refresh token, returning a fresh pair.
    ///
    /// Presenting a rotated or revoked id revokes the entire chain and
    /// fails with `TokenReuse`. An expired-but-active token fails with
    /// `TokenExpired` and is not treated as reuse.
    pub async fn refresh(&self, token_id: &str) -> Result<TokenPair, AuthError> {
        let now = Utc::now();
        let id = token_id.to_string();

        let mut uow = self.tokens.begin().await?;
        let presented = match uow.get(&id).await? {
            Some(token) => token,
            None => return Err(AuthError::TokenInvalid("unknown refresh token".to_string())),
        };

        match presented.state() {
            TokenState::Rotated | TokenState::Revoked => {
                let revoked = revoke_chain(&mut uow, &presented).await?;
                uow.commit().await?;
                tracing::warn!(
                    user_id = %presented.user_id,
                    revoked,
                    "refresh token reuse detected; session chain revoked"
                );
                Err(AuthError::TokenReuse)
            }
            TokenState::Active if presented.is_expired(now) => Err(AuthError::TokenExpired),
            TokenState::Active => {
                let user = self
                    .users
                    .get(&presented.user_id)
                    .await?
                    .filter(|u| u.is_active)
                    .ok_or_else(|| {
                        AuthError::TokenInvalid("no active user for refresh token".to_string())
                    })?;

                let successor = self.mint_refresh(user.user_id, now)?;
                let mut rotated = presented;
                rotated.replaced_by = Some(successor.token_id.clone());

                if let Err(e) = uow.update(rotated).await {
                    drop(uow);
                    return self.after_rotation_conflict(&id, e).await;
                }
                let successor = uow.add(successor).await?;
                if let Err(e) = uow.commit().await {
                    return self.after_rotation_conflict(&id, e).await;
                }

                self.build_pair(&user, &successor, now)
            }
        }
    }

    /// A concurrent rotation won the race. Re-read the committed state: if
    /// the token is now rotated or revoked this is the reuse path, not a
    /// generic conflict.
    async fn after_rotation_conflict(
        &self,
        token_id: &str,
        original: AuthError,
    ) -> Result<TokenPair, AuthError> {
        if !matches!(original, AuthError::Conflict(_)) {
            return Err(original);
        }

        let mut uow = self.tokens.begin().await?;
        let current = match uow.get(&token_id.to_string()).await? {
            Some(token) => token,
            None => return Err(original),
        };
        match current.state() {
            TokenState::Rotated | TokenState::Revoked => {
                let revoked = revoke_chain(&mut uow, &current).await?;
                uow.commit().await?;
                tracing::warn!(
                    user_id = %current.user_id,
                    revoked,
                    "refresh token reuse detected after rotation race; session chain revoked"
                );
                Err(AuthError::TokenReuse)
            }
            TokenState::Active => Err(original),
        }
    }

    /// Revoke a single refresh token (logout).
    pub async fn revoke(&self, token_id: &str) -> Result<(), AuthError> {
        let id = token_id.to_string();
        let mut token = self
            .tokens
            .get(&id)
            .await?
            .ok_or_else(|| AuthError::TokenInvalid("unknown refresh token".to_string()))?;

        if token.revoked {
            return Ok(());
        }
        token.revoked = true;
        self.tokens.update(token).await?;
        Ok(())
    }

    /// Revoke every unrevoked refresh token belonging to a user, as one
    /// transaction. Used on password change and account deactivation.
    pub async fn revoke_all_for_user(&self, user_id: Uuid) -> Result<usize, AuthError> {
        let mut uow = self.tokens.begin().await?;
        let outstanding = uow
            .find(&RefreshTokenFilter {
                user_id: Some(user_id),
                unrevoked_only: true,
                ..Default::default()
            })
            .await?;

        let count = outstanding.len();
        for mut token in outstanding {
            token.revoked = true;
            uow.update(token).await?;
        }
        uow.commit().await?;

        if count > 0 {
            tracing::info!(user_id = %user_id, count, "revoked all refresh tokens for user");
        }
        Ok(count)
    }
}

#[async_trait]
impl<S, R> SessionRevoker for TokenService<S, R>
where
    S: Transactional<RefreshToken>,
    R: Repository<User>,
{
    async fn revoke_all_sessions(&self, user_id: Uuid) -> Result<(), AuthError> {
        self.revoke_all_for_user(user_id).await.map(|_| ())
    }
}

/// Revoke every token reachable from `start` through `replaced_by` links,
/// walking back to the chain's root first. Returns how many tokens were
/// newly revoked.
async fn revoke_chain<U: UnitOfWork<RefreshToken>>(
    uow: &mut U,
    start: &RefreshToken,
) -> Result<usize, AuthError> {
    let mut visited: HashSet<String> = HashSet::new();

    // Walk backward to the root.
    let mut root = start.clone();
    while visited.insert(root.token_id.clone()) {
        if visited.len() > MAX_CHAIN_LENGTH {
            return Err(AuthError::TokenInvalid("refresh chain too long".to_string()));
        }
        let parents = uow
            .find(&RefreshTokenFilter {
                replaced_by: Some(root.token_id.clone()),
                ..Default::default()
            })
            .await?;
        match parents.into_iter().next() {
            Some(parent) => root = parent,
            None => break,
        }
    }

    // Walk forward from the root, revoking as we go.
    visited.clear();
    let mut revoked = 0;
    let mut cursor = Some(root);
    while let Some(mut token) = cursor.take() {
        if !visited.insert(token.token_id.clone()) {
            break;
        }
        if visited.len() > MAX_CHAIN_LENGTH {
            return Err(AuthError::TokenInvalid("refresh chain too long".to_string()));
        }
        let next_id = token.replaced_by.clone();
        if !token.revoked {
            token.revoked = true;
            uow.update(token).await?;
            revoked += 1;
        }
        if let Some(next_id) = next_id {
            cursor = uow.get(&next_id).await?;
        }
    }

    Ok(revoked)
}
