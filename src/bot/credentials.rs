use crate::bot::now_unix_ms;
use crate::bot::types::Credentials;
use crate::error::AppError;
use sqlx::SqlitePool;
use tracing::{debug, warn};

pub const CREDENTIALS_KEY: &str = "reivun.credentials";

/// Durable single-record store for the exchange credentials.
///
/// The record lives under one well-known key and is overwritten on every save.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    pool: SqlitePool,
}

impl CredentialStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn save(&self, credentials: &Credentials) -> Result<(), AppError> {
        let payload = simd_json::serde::to_string(credentials)?;

        sqlx::query(
            "INSERT INTO kv_store (key, value, updated_at_ms) VALUES (?, ?, ?) \
             ON CONFLICT(key) DO UPDATE SET value=excluded.value, updated_at_ms=excluded.updated_at_ms",
        )
        .bind(CREDENTIALS_KEY)
        .bind(payload)
        .bind(now_unix_ms())
        .execute(&self.pool)
        .await?;

        debug!(key = CREDENTIALS_KEY, "credentials saved");
        Ok(())
    }

    /// Returns `None` when nothing was saved yet or the stored payload is unreadable.
    pub async fn load(&self) -> Result<Option<Credentials>, AppError> {
        let stored =
            sqlx::query_scalar::<_, String>("SELECT value FROM kv_store WHERE key = ?")
                .bind(CREDENTIALS_KEY)
                .fetch_optional(&self.pool)
                .await?;

        let Some(raw) = stored else {
            return Ok(None);
        };

        let mut payload = raw.into_bytes();
        match simd_json::serde::from_slice::<Credentials>(&mut payload) {
            Ok(credentials) => Ok(Some(credentials)),
            Err(error) => {
                warn!(key = CREDENTIALS_KEY, %error, "stored credentials are corrupt; ignoring");
                Ok(None)
            }
        }
    }
}
