//! Per-user model rows with optimistic-lock writes and checksum-verified
//! reads, grounded on `persistence/model_store.py`'s expected-version CAS and
//! base64-length/SHA-256 integrity check.

use crate::domain::model::{ModelType, StoredModel};
use crate::error::SentinelError;
use async_trait::async_trait;
use base64::Engine;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

const MAX_LEARN_ATTEMPTS: usize = 3;

fn checksum(blob: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(blob.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// `true` if `blob` is a plausible base64 payload and its checksum matches.
/// Length-mod-4 catches truncation without needing a full decode.
pub fn verify_blob(blob: &str, expected_checksum: &str) -> bool {
    if blob.len() % 4 != 0 {
        return false;
    }
    checksum(blob) == expected_checksum
}

/// Model row persistence plus the non-blocking per-(user, model) learning
/// lock: `learn_with_retry` skips the update entirely (rather than blocking)
/// if another task already holds the lock for that key, matching the
/// skip-if-busy semantics of the original's `asyncio.Lock` + `acquire(blocking=False)`.
#[async_trait]
pub trait ModelStore: Send + Sync {
    async fn load(&self, user_id: &str, model_type: ModelType) -> Result<Option<StoredModel>, SentinelError>;

    async fn save_with_expected_version(
        &self,
        model: &StoredModel,
        expected_version: i64,
    ) -> Result<(), SentinelError>;

    /// Loads the current row (or builds `default` if absent), applies
    /// `learn` to the deserialized blob via `codec`, and writes it back with
    /// an incremented version, retrying on version conflicts up to
    /// [`MAX_LEARN_ATTEMPTS`] times. Returns `Ok(false)` without error if the
    /// per-(user, model) lock was already held, so callers can skip learning
    /// for this request rather than block on it.
    async fn learn_with_retry(
        &self,
        user_id: &str,
        model_type: ModelType,
        learn: &mut dyn FnMut(&mut String, u64) -> (String, u64),
    ) -> Result<bool, SentinelError>;
}

#[derive(Default)]
pub struct InMemoryModelStore {
    rows: Mutex<HashMap<(String, ModelType), StoredModel>>,
    locks: DashMap<(String, ModelType), ()>,
}

impl InMemoryModelStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ModelStore for InMemoryModelStore {
    async fn load(&self, user_id: &str, model_type: ModelType) -> Result<Option<StoredModel>, SentinelError> {
        let rows = self.rows.lock().expect("lock poisoned");
        let row = rows.get(&(user_id.to_string(), model_type)).cloned();
        if let Some(r) = &row {
            if !verify_blob(&r.blob, &r.checksum) {
                return Err(SentinelError::ModelCorruption(format!("checksum mismatch for {user_id}/{model_type:?}")));
            }
        }
        Ok(row)
    }

    async fn save_with_expected_version(&self, model: &StoredModel, expected_version: i64) -> Result<(), SentinelError> {
        let mut rows = self.rows.lock().expect("lock poisoned");
        let key = (model.user_id.clone(), model.model_type);
        let current_version = rows.get(&key).map(|r| r.model_version).unwrap_or(0);
        if current_version != expected_version {
            return Err(SentinelError::StoreConflict(format!(
                "expected version {expected_version}, found {current_version}"
            )));
        }
        rows.insert(key, model.clone());
        Ok(())
    }

    async fn learn_with_retry(
        &self,
        user_id: &str,
        model_type: ModelType,
        learn: &mut dyn FnMut(&mut String, u64) -> (String, u64),
    ) -> Result<bool, SentinelError> {
        let lock_key = (user_id.to_string(), model_type);
        if self.locks.contains_key(&lock_key) {
            return Ok(false);
        }
        self.locks.insert(lock_key.clone(), ());
        let result = (|| async {
            for _ in 0..MAX_LEARN_ATTEMPTS {
                let existing = self.load(user_id, model_type).await?;
                let (mut blob, version, window_count, now) = match &existing {
                    Some(row) => (row.blob.clone(), row.model_version, row.feature_window_count, row.updated_at),
                    None => (String::new(), 0, 0, 0),
                };
                let (new_blob, new_window_count) = learn(&mut blob, window_count);
                let model = StoredModel {
                    user_id: user_id.to_string(),
                    model_type,
                    checksum: checksum(&new_blob),
                    blob: new_blob,
                    feature_window_count: new_window_count,
                    model_version: version + 1,
                    created_at: existing.as_ref().map(|r| r.created_at).unwrap_or(now),
                    updated_at: now,
                };
                match self.save_with_expected_version(&model, version).await {
                    Ok(()) => return Ok(true),
                    Err(SentinelError::StoreConflict(_)) => continue,
                    Err(e) => return Err(e),
                }
            }
            Err(SentinelError::StoreConflict(format!("learn retries exhausted for {user_id}/{model_type:?}")))
        })()
        .await;
        self.locks.remove(&lock_key);
        result
    }
}

/// Postgres-backed implementation. Rows live in `user_behavior_models`
/// (user_id, model_type, blob, feature_window_count, model_version,
/// checksum, created_at, updated_at), unique on (user_id, model_type);
/// `save_with_expected_version` is a single `UPDATE ... WHERE model_version =
/// $expected` (or `INSERT ... ON CONFLICT DO NOTHING` for the first write),
/// checking `rows_affected() == 1` to detect a lost race.
pub struct PostgresModelStore {
    pool: PgPool,
    locks: Arc<DashMap<(String, ModelType), ()>>,
}

impl PostgresModelStore {
    pub async fn connect(database_url: &str) -> Result<Self, SentinelError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| SentinelError::StoreUnavailable(format!("postgres connect: {e}")))?;
        Ok(Self {
            pool,
            locks: Arc::new(DashMap::new()),
        })
    }
}

#[async_trait]
impl ModelStore for PostgresModelStore {
    async fn load(&self, user_id: &str, model_type: ModelType) -> Result<Option<StoredModel>, SentinelError> {
        let row = sqlx::query(
            "SELECT user_id, model_type, blob, feature_window_count, model_version, checksum, created_at, updated_at \
             FROM user_behavior_models WHERE user_id = $1 AND model_type = $2",
        )
        .bind(user_id)
        .bind(model_type.column_value())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SentinelError::StoreUnavailable(format!("postgres load: {e}")))?;

        let Some(row) = row else { return Ok(None) };
        let blob: String = row.try_get("blob").map_err(|e| SentinelError::InternalUnknown(e.to_string()))?;
        let checksum_value: String = row.try_get("checksum").map_err(|e| SentinelError::InternalUnknown(e.to_string()))?;
        if !verify_blob(&blob, &checksum_value) {
            return Err(SentinelError::ModelCorruption(format!("checksum mismatch for {user_id}/{model_type:?}")));
        }
        Ok(Some(StoredModel {
            user_id: user_id.to_string(),
            model_type,
            blob,
            feature_window_count: row.try_get::<i64, _>("feature_window_count").unwrap_or(0) as u64,
            model_version: row.try_get("model_version").unwrap_or(0),
            checksum: checksum_value,
            created_at: row.try_get("created_at").unwrap_or(0),
            updated_at: row.try_get("updated_at").unwrap_or(0),
        }))
    }

    async fn save_with_expected_version(&self, model: &StoredModel, expected_version: i64) -> Result<(), SentinelError> {
        let result = if expected_version == 0 {
            sqlx::query(
                "INSERT INTO user_behavior_models \
                 (user_id, model_type, blob, feature_window_count, model_version, checksum, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, 1, $5, $6, $6) \
                 ON CONFLICT (user_id, model_type) DO NOTHING",
            )
            .bind(&model.user_id)
            .bind(model.model_type.column_value())
            .bind(&model.blob)
            .bind(model.feature_window_count as i64)
            .bind(&model.checksum)
            .bind(model.updated_at)
            .execute(&self.pool)
            .await
        } else {
            sqlx::query(
                "UPDATE user_behavior_models SET blob = $1, feature_window_count = $2, model_version = $3, \
                 checksum = $4, updated_at = $5 \
                 WHERE user_id = $6 AND model_type = $7 AND model_version = $8",
            )
            .bind(&model.blob)
            .bind(model.feature_window_count as i64)
            .bind(model.model_version)
            .bind(&model.checksum)
            .bind(model.updated_at)
            .bind(&model.user_id)
            .bind(model.model_type.column_value())
            .bind(expected_version)
            .execute(&self.pool)
            .await
        }
        .map_err(|e| SentinelError::StoreUnavailable(format!("postgres save: {e}")))?;

        if result.rows_affected() != 1 {
            return Err(SentinelError::StoreConflict(format!(
                "expected version {expected_version} no longer current for {}/{:?}",
                model.user_id, model.model_type
            )));
        }
        Ok(())
    }

    async fn learn_with_retry(
        &self,
        user_id: &str,
        model_type: ModelType,
        learn: &mut dyn FnMut(&mut String, u64) -> (String, u64),
    ) -> Result<bool, SentinelError> {
        let lock_key = (user_id.to_string(), model_type);
        if self.locks.contains_key(&lock_key) {
            return Ok(false);
        }
        self.locks.insert(lock_key.clone(), ());
        let result = (|| async {
            for _ in 0..MAX_LEARN_ATTEMPTS {
                let existing = self.load(user_id, model_type).await?;
                let (mut blob, version, window_count, created_at) = match &existing {
                    Some(row) => (row.blob.clone(), row.model_version, row.feature_window_count, row.created_at),
                    None => (String::new(), 0, 0, 0),
                };
                let (new_blob, new_window_count) = learn(&mut blob, window_count);
                let model = StoredModel {
                    user_id: user_id.to_string(),
                    model_type,
                    checksum: checksum(&new_blob),
                    blob: new_blob,
                    feature_window_count: new_window_count,
                    model_version: version + 1,
                    created_at,
                    updated_at: created_at,
                };
                match self.save_with_expected_version(&model, version).await {
                    Ok(()) => return Ok(true),
                    Err(SentinelError::StoreConflict(_)) => continue,
                    Err(e) => return Err(e),
                }
            }
            Err(SentinelError::StoreConflict(format!("learn retries exhausted for {user_id}/{model_type:?}")))
        })()
        .await;
        self.locks.remove(&lock_key);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_round_trips() {
        let blob = "eyJhIjoxfQ==".to_string();
        let sum = checksum(&blob);
        assert!(verify_blob(&blob, &sum));
    }

    #[test]
    fn truncated_blob_fails_length_check() {
        assert!(!verify_blob("abc", "anything"));
    }

    #[tokio::test]
    async fn learn_with_retry_increments_version() {
        let store = InMemoryModelStore::new();
        store
            .learn_with_retry("u1", ModelType::Hst, &mut |_blob, count| ("blob-v1".to_string(), count + 1))
            .await
            .unwrap();
        let row = store.load("u1", ModelType::Hst).await.unwrap().unwrap();
        assert_eq!(row.model_version, 1);
        assert_eq!(row.feature_window_count, 1);

        store
            .learn_with_retry("u1", ModelType::Hst, &mut |_blob, count| ("blob-v2".to_string(), count + 1))
            .await
            .unwrap();
        let row = store.load("u1", ModelType::Hst).await.unwrap().unwrap();
        assert_eq!(row.model_version, 2);
        assert_eq!(row.feature_window_count, 2);
    }
}
