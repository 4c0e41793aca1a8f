//! TOFU (trust-on-first-use) device and geo history, read-through cached and
//! write-behind persisted, grounded on `repository.py`'s `_cap_known_devices`
//! cap and its read-through user-context cache.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use std::collections::HashSet;

use crate::context::GeoPoint;
use crate::error::SentinelError;

const MAX_KNOWN_DEVICES: usize = 20;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrustedContext {
    pub known_devices: Vec<String>,
    pub last_ip: Option<String>,
    pub last_coords: Option<GeoPoint>,
    pub last_seen_ms: Option<i64>,
}

impl TrustedContext {
    pub fn known_device_set(&self) -> HashSet<String> {
        self.known_devices.iter().cloned().collect()
    }

    /// Appends `device_id` if new, evicting the oldest entry once the cap is
    /// exceeded (first-seen devices age out before recent ones).
    pub fn remember_device(&mut self, device_id: &str) {
        if self.known_devices.iter().any(|d| d == device_id) {
            return;
        }
        self.known_devices.push(device_id.to_string());
        if self.known_devices.len() > MAX_KNOWN_DEVICES {
            let overflow = self.known_devices.len() - MAX_KNOWN_DEVICES;
            self.known_devices.drain(0..overflow);
        }
    }
}

#[async_trait]
pub trait TrustedContextStore: Send + Sync {
    async fn get_trusted_context(&self, user_id: &str) -> Result<TrustedContext, SentinelError>;
    async fn save_trusted_context(&self, user_id: &str, ctx: &TrustedContext) -> Result<(), SentinelError>;
}

#[derive(Default)]
pub struct InMemoryTrustedContextStore {
    rows: DashMap<String, TrustedContext>,
}

impl InMemoryTrustedContextStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TrustedContextStore for InMemoryTrustedContextStore {
    async fn get_trusted_context(&self, user_id: &str) -> Result<TrustedContext, SentinelError> {
        Ok(self.rows.get(user_id).map(|r| r.clone()).unwrap_or_default())
    }

    async fn save_trusted_context(&self, user_id: &str, ctx: &TrustedContext) -> Result<(), SentinelError> {
        self.rows.insert(user_id.to_string(), ctx.clone());
        Ok(())
    }
}

/// Postgres-backed durable store fronted by an in-process cache: reads check
/// the cache first and only fall through to the database on a miss; writes
/// update the cache immediately and persist in the background call path
/// (write-behind from the caller's perspective — `save_trusted_context`
/// itself still awaits the write, but the orchestrator never blocks an
/// evaluate response on it finishing).
pub struct PostgresTrustedContextStore {
    pool: PgPool,
    cache: DashMap<String, TrustedContext>,
}

impl PostgresTrustedContextStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            cache: DashMap::new(),
        }
    }
}

#[async_trait]
impl TrustedContextStore for PostgresTrustedContextStore {
    async fn get_trusted_context(&self, user_id: &str) -> Result<TrustedContext, SentinelError> {
        if let Some(cached) = self.cache.get(user_id) {
            return Ok(cached.clone());
        }
        let row = sqlx::query(
            "SELECT known_devices, last_ip, last_geo_data, updated_at FROM user_context WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SentinelError::StoreUnavailable(format!("postgres load trusted context: {e}")))?;

        let ctx = match row {
            None => TrustedContext::default(),
            Some(row) => {
                let known_devices_json: String = row.try_get("known_devices").unwrap_or_else(|_| "[]".to_string());
                let known_devices: Vec<String> = serde_json::from_str(&known_devices_json).unwrap_or_default();
                let last_geo_json: Option<String> = row.try_get("last_geo_data").ok();
                let last_coords = last_geo_json
                    .and_then(|raw| serde_json::from_str::<GeoPoint>(&raw).ok());
                TrustedContext {
                    known_devices,
                    last_ip: row.try_get("last_ip").ok(),
                    last_coords,
                    last_seen_ms: row.try_get("updated_at").ok(),
                }
            }
        };
        self.cache.insert(user_id.to_string(), ctx.clone());
        Ok(ctx)
    }

    async fn save_trusted_context(&self, user_id: &str, ctx: &TrustedContext) -> Result<(), SentinelError> {
        self.cache.insert(user_id.to_string(), ctx.clone());
        let known_devices_json = serde_json::to_string(&ctx.known_devices)
            .map_err(|e| SentinelError::InternalUnknown(format!("encode known_devices: {e}")))?;
        let last_geo_json = ctx
            .last_coords
            .map(|c| serde_json::to_string(&c))
            .transpose()
            .map_err(|e| SentinelError::InternalUnknown(format!("encode last_geo_data: {e}")))?;
        sqlx::query(
            "INSERT INTO user_context (user_id, known_devices, last_ip, last_geo_data, updated_at) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (user_id) DO UPDATE SET known_devices = $2, last_ip = $3, last_geo_data = $4, updated_at = $5",
        )
        .bind(user_id)
        .bind(known_devices_json)
        .bind(&ctx.last_ip)
        .bind(last_geo_json)
        .bind(ctx.last_seen_ms)
        .execute(&self.pool)
        .await
        .map_err(|e| SentinelError::StoreUnavailable(format!("postgres save trusted context: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remember_device_caps_at_twenty() {
        let mut ctx = TrustedContext::default();
        for i in 0..25 {
            ctx.remember_device(&format!("dev-{i}"));
        }
        assert_eq!(ctx.known_devices.len(), MAX_KNOWN_DEVICES);
        assert_eq!(ctx.known_devices.first().unwrap(), "dev-5");
    }

    #[test]
    fn remember_device_is_idempotent() {
        let mut ctx = TrustedContext::default();
        ctx.remember_device("dev-1");
        ctx.remember_device("dev-1");
        assert_eq!(ctx.known_devices.len(), 1);
    }

    #[tokio::test]
    async fn in_memory_round_trips() {
        let store = InMemoryTrustedContextStore::new();
        let mut ctx = store.get_trusted_context("u1").await.unwrap();
        ctx.remember_device("dev-1");
        store.save_trusted_context("u1", &ctx).await.unwrap();
        let reloaded = store.get_trusted_context("u1").await.unwrap();
        assert_eq!(reloaded.known_devices, vec!["dev-1".to_string()]);
    }
}
