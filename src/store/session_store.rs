//! Session and per-modality state. Three keys per session form one logical
//! transaction; a get-modify-compare-swap loop enforces atomicity across them
//! without a distributed transaction, grounded on the key-per-aggregate
//! layout in `persistence/session_repository.py` and `persistence/repository.py`.

use super::rate_limit::FixedWindowCounter;
use crate::domain::session::{KeyboardState, MouseState, SessionState};
use crate::error::SentinelError;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Mutex;

const CAS_RETRIES: usize = 5;
const STREAM_RATE_LIMIT_PER_SEC: u64 = 20;
const EVAL_RATE_LIMIT_PER_SEC: u64 = 10;
const EVAL_DEDUP_TTL_SECS: i64 = 60;

fn session_key(session_id: &str) -> String {
    format!("SESSION:{session_id}")
}
fn keyboard_key(session_id: &str) -> String {
    format!("KEYBOARD_STATE:{session_id}")
}
fn mouse_key(session_id: &str) -> String {
    format!("MOUSE_STATE:{session_id}")
}
fn stream_rate_key(session_id: &str, epoch_s: i64) -> String {
    format!("STREAM_RATE:{session_id}:{epoch_s}")
}
fn eval_rate_key(session_id: &str, epoch_s: i64) -> String {
    format!("EVAL_RATE:{session_id}:{epoch_s}")
}
fn eval_dedup_key(eval_id: &str) -> String {
    format!("EVAL_DEDUP:{eval_id}")
}

/// The session/modality persistence contract. Implementations must apply
/// writes atomically (single key compare-and-swap, or all-or-nothing for the
/// two-key keyboard/mouse updates) and are expected to fail open: a
/// `StoreUnavailable` on a rate-limit check must not itself block the caller.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get_or_create_session(&self, session_id: &str, now_ms: i64) -> Result<SessionState, SentinelError>;

    async fn get_keyboard_state(&self, session_id: &str) -> Result<KeyboardState, SentinelError>;
    async fn get_mouse_state(&self, session_id: &str) -> Result<MouseState, SentinelError>;

    /// Applies `mutate` to the current keyboard state and writes it back only
    /// if nothing else has written it since the read, retrying up to
    /// [`CAS_RETRIES`] times. `mutate` may be called more than once.
    async fn update_keyboard_atomic(
        &self,
        session_id: &str,
        mutate: &mut dyn FnMut(&mut KeyboardState),
    ) -> Result<KeyboardState, SentinelError>;

    async fn update_mouse_atomic(
        &self,
        session_id: &str,
        mutate: &mut dyn FnMut(&mut MouseState),
    ) -> Result<MouseState, SentinelError>;

    async fn update_session_atomic(
        &self,
        session_id: &str,
        mutate: &mut dyn FnMut(&mut SessionState),
    ) -> Result<SessionState, SentinelError>;

    /// True if this call would exceed the per-second stream ingest budget.
    /// Fails open (returns `Ok(false)`) on store errors.
    async fn check_stream_rate_limit(&self, session_id: &str, now_ms: i64) -> bool;

    /// True if this call would exceed the per-second evaluate budget.
    async fn check_eval_rate_limit(&self, session_id: &str, now_ms: i64) -> bool;

    /// Idempotency guard: true if `eval_id` was already processed within the
    /// dedup window.
    async fn is_eval_processed(&self, eval_id: &str) -> Result<bool, SentinelError>;
    async fn mark_eval_processed(&self, eval_id: &str, now_ms: i64) -> Result<(), SentinelError>;

    /// Writes a provisional ban marker for `user_id` with a 300 s TTL, only
    /// if none already exists (NX) — a BLOCK decision must never shorten or
    /// overwrite a longer-lived ban an auditor placed by hand.
    async fn mark_provisional_ban(&self, user_id: &str, now_ms: i64) -> Result<(), SentinelError>;
}

/// In-memory fake for orchestrator unit and integration tests. Not clustered,
/// not persistent — a single process's view of the world, same shape as the
/// Redis-backed store minus the network.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<String, SessionState>>,
    keyboard: Mutex<HashMap<String, KeyboardState>>,
    mouse: Mutex<HashMap<String, MouseState>>,
    stream_hits: FixedWindowCounter,
    eval_hits: FixedWindowCounter,
    eval_dedup: Mutex<HashMap<String, i64>>,
    provisional_bans: Mutex<HashMap<String, i64>>,
}

const PROVISIONAL_BAN_TTL_SECS: i64 = 300;

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get_or_create_session(&self, session_id: &str, now_ms: i64) -> Result<SessionState, SentinelError> {
        let mut map = self.sessions.lock().expect("lock poisoned");
        Ok(map.entry(session_id.to_string()).or_insert_with(|| SessionState::new(session_id, now_ms)).clone())
    }

    async fn get_keyboard_state(&self, session_id: &str) -> Result<KeyboardState, SentinelError> {
        Ok(self.keyboard.lock().expect("lock poisoned").get(session_id).cloned().unwrap_or_default())
    }

    async fn get_mouse_state(&self, session_id: &str) -> Result<MouseState, SentinelError> {
        Ok(self.mouse.lock().expect("lock poisoned").get(session_id).cloned().unwrap_or_default())
    }

    async fn update_keyboard_atomic(
        &self,
        session_id: &str,
        mutate: &mut dyn FnMut(&mut KeyboardState),
    ) -> Result<KeyboardState, SentinelError> {
        let mut map = self.keyboard.lock().expect("lock poisoned");
        let state = map.entry(session_id.to_string()).or_default();
        mutate(state);
        Ok(state.clone())
    }

    async fn update_mouse_atomic(
        &self,
        session_id: &str,
        mutate: &mut dyn FnMut(&mut MouseState),
    ) -> Result<MouseState, SentinelError> {
        let mut map = self.mouse.lock().expect("lock poisoned");
        let state = map.entry(session_id.to_string()).or_default();
        mutate(state);
        Ok(state.clone())
    }

    async fn update_session_atomic(
        &self,
        session_id: &str,
        mutate: &mut dyn FnMut(&mut SessionState),
    ) -> Result<SessionState, SentinelError> {
        let mut map = self.sessions.lock().expect("lock poisoned");
        let state = map
            .entry(session_id.to_string())
            .or_insert_with(|| SessionState::new(session_id, 0));
        mutate(state);
        Ok(state.clone())
    }

    async fn check_stream_rate_limit(&self, session_id: &str, now_ms: i64) -> bool {
        self.stream_hits.hit(session_id, now_ms, STREAM_RATE_LIMIT_PER_SEC)
    }

    async fn check_eval_rate_limit(&self, session_id: &str, now_ms: i64) -> bool {
        self.eval_hits.hit(session_id, now_ms, EVAL_RATE_LIMIT_PER_SEC)
    }

    async fn is_eval_processed(&self, eval_id: &str) -> Result<bool, SentinelError> {
        Ok(self.eval_dedup.lock().expect("lock poisoned").contains_key(eval_id))
    }

    async fn mark_eval_processed(&self, eval_id: &str, now_ms: i64) -> Result<(), SentinelError> {
        let mut map = self.eval_dedup.lock().expect("lock poisoned");
        map.retain(|_, ts| now_ms - *ts < EVAL_DEDUP_TTL_SECS * 1000);
        map.insert(eval_id.to_string(), now_ms);
        Ok(())
    }

    async fn mark_provisional_ban(&self, user_id: &str, now_ms: i64) -> Result<(), SentinelError> {
        let mut map = self.provisional_bans.lock().expect("lock poisoned");
        map.retain(|_, ts| now_ms - *ts < PROVISIONAL_BAN_TTL_SECS * 1000);
        map.entry(user_id.to_string()).or_insert(now_ms);
        Ok(())
    }
}

/// Redis-backed implementation. Session/keyboard/mouse rows are JSON blobs
/// under their own keys with a TTL refreshed on every write; the two-key
/// keyboard/mouse CAS loops use optimistic WATCH/MULTI/EXEC semantics via
/// plain read-compare-write retries rather than a Lua script, since each
/// update only ever touches a single key (keyboard and mouse state are
/// stored independently, not as one aggregate).
pub struct RedisSessionStore {
    conn: ConnectionManager,
}

impl RedisSessionStore {
    pub async fn connect(redis_url: &str) -> Result<Self, SentinelError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| SentinelError::StoreUnavailable(format!("redis client: {e}")))?;
        let conn = client
            .get_tokio_connection_manager()
            .await
            .map_err(|e| SentinelError::StoreUnavailable(format!("redis connect: {e}")))?;
        Ok(Self { conn })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>, SentinelError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(key)
            .await
            .map_err(|e| SentinelError::StoreUnavailable(format!("redis get {key}: {e}")))?;
        match raw {
            None => Ok(None),
            Some(s) => serde_json::from_str(&s)
                .map(Some)
                .map_err(|e| SentinelError::ModelCorruption(format!("decode {key}: {e}"))),
        }
    }

    async fn set_json<T: serde::Serialize>(&self, key: &str, value: &T, ttl_secs: i64) -> Result<(), SentinelError> {
        let mut conn = self.conn.clone();
        let raw = serde_json::to_string(value).map_err(|e| SentinelError::InternalUnknown(format!("encode {key}: {e}")))?;
        let _: () = conn
            .set_ex(key, raw, ttl_secs as u64)
            .await
            .map_err(|e| SentinelError::StoreUnavailable(format!("redis set {key}: {e}")))?;
        Ok(())
    }

    /// WATCH the key, read-modify-write inside MULTI/EXEC, retry on
    /// contention. EXEC returns `nil` when the watched key changed between
    /// WATCH and EXEC; that is the only retry trigger.
    async fn cas_loop<T, F>(&self, key: &str, ttl_secs: i64, default: impl Fn() -> T, mut mutate: F) -> Result<T, SentinelError>
    where
        T: serde::Serialize + serde::de::DeserializeOwned + Clone,
        F: FnMut(&mut T),
    {
        let mut conn = self.conn.clone();
        for _ in 0..CAS_RETRIES {
            redis::cmd("WATCH")
                .arg(key)
                .query_async::<_, ()>(&mut conn)
                .await
                .map_err(|e| SentinelError::StoreUnavailable(format!("redis watch {key}: {e}")))?;

            let mut current = self.get_json::<T>(key).await?.unwrap_or_else(&default);
            mutate(&mut current);
            let raw = serde_json::to_string(&current).map_err(|e| SentinelError::InternalUnknown(format!("encode {key}: {e}")))?;

            let mut pipe = redis::pipe();
            pipe.atomic().set_ex(key, raw, ttl_secs as u64);
            let result: redis::RedisResult<Option<()>> = pipe.query_async(&mut conn).await;

            match result {
                Ok(Some(())) => return Ok(current),
                Ok(None) => continue, // another writer won the race, retry
                Err(e) => return Err(SentinelError::StoreUnavailable(format!("redis exec {key}: {e}"))),
            }
        }
        Err(SentinelError::StoreConflict(format!("cas exhausted for {key}")))
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn get_or_create_session(&self, session_id: &str, now_ms: i64) -> Result<SessionState, SentinelError> {
        let key = session_key(session_id);
        if let Some(state) = self.get_json::<SessionState>(&key).await? {
            return Ok(state);
        }
        let fresh = SessionState::new(session_id, now_ms);
        self.set_json(&key, &fresh, crate::domain::session::SESSION_TTL_SECS).await?;
        Ok(fresh)
    }

    async fn get_keyboard_state(&self, session_id: &str) -> Result<KeyboardState, SentinelError> {
        Ok(self.get_json(&keyboard_key(session_id)).await?.unwrap_or_default())
    }

    async fn get_mouse_state(&self, session_id: &str) -> Result<MouseState, SentinelError> {
        Ok(self.get_json(&mouse_key(session_id)).await?.unwrap_or_default())
    }

    async fn update_keyboard_atomic(
        &self,
        session_id: &str,
        mutate: &mut dyn FnMut(&mut KeyboardState),
    ) -> Result<KeyboardState, SentinelError> {
        self.cas_loop(&keyboard_key(session_id), crate::domain::session::SESSION_TTL_SECS, KeyboardState::default, mutate)
            .await
    }

    async fn update_mouse_atomic(
        &self,
        session_id: &str,
        mutate: &mut dyn FnMut(&mut MouseState),
    ) -> Result<MouseState, SentinelError> {
        self.cas_loop(&mouse_key(session_id), crate::domain::session::SESSION_TTL_SECS, MouseState::default, mutate)
            .await
    }

    async fn update_session_atomic(
        &self,
        session_id: &str,
        mutate: &mut dyn FnMut(&mut SessionState),
    ) -> Result<SessionState, SentinelError> {
        let sid = session_id.to_string();
        self.cas_loop(
            &session_key(session_id),
            crate::domain::session::SESSION_TTL_SECS,
            move || SessionState::new(sid.clone(), 0),
            mutate,
        )
        .await
    }

    async fn check_stream_rate_limit(&self, session_id: &str, now_ms: i64) -> bool {
        let epoch_s = now_ms / 1000;
        let key = stream_rate_key(session_id, epoch_s);
        let mut conn = self.conn.clone();
        let count: redis::RedisResult<u64> = async {
            let n: u64 = conn.incr(&key, 1u64).await?;
            let _: () = conn.expire(&key, 2).await?;
            Ok(n)
        }
        .await;
        match count {
            Ok(n) => n > STREAM_RATE_LIMIT_PER_SEC,
            Err(_) => false,
        }
    }

    async fn check_eval_rate_limit(&self, session_id: &str, now_ms: i64) -> bool {
        let epoch_s = now_ms / 1000;
        let key = eval_rate_key(session_id, epoch_s);
        let mut conn = self.conn.clone();
        let count: redis::RedisResult<u64> = async {
            let n: u64 = conn.incr(&key, 1u64).await?;
            let _: () = conn.expire(&key, 2).await?;
            Ok(n)
        }
        .await;
        match count {
            Ok(n) => n > EVAL_RATE_LIMIT_PER_SEC,
            Err(_) => false,
        }
    }

    async fn is_eval_processed(&self, eval_id: &str) -> Result<bool, SentinelError> {
        let mut conn = self.conn.clone();
        let exists: bool = conn
            .exists(eval_dedup_key(eval_id))
            .await
            .map_err(|e| SentinelError::StoreUnavailable(format!("redis exists: {e}")))?;
        Ok(exists)
    }

    async fn mark_eval_processed(&self, eval_id: &str, _now_ms: i64) -> Result<(), SentinelError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(eval_dedup_key(eval_id), 1u8, EVAL_DEDUP_TTL_SECS as u64)
            .await
            .map_err(|e| SentinelError::StoreUnavailable(format!("redis setex: {e}")))?;
        Ok(())
    }

    async fn mark_provisional_ban(&self, user_id: &str, _now_ms: i64) -> Result<(), SentinelError> {
        let mut conn = self.conn.clone();
        let key = format!("blacklist:{user_id}");
        let _: redis::RedisResult<bool> = redis::cmd("SET")
            .arg(&key)
            .arg(1u8)
            .arg("EX")
            .arg(PROVISIONAL_BAN_TTL_SECS)
            .arg("NX")
            .query_async(&mut conn)
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn creates_then_reuses_session() {
        let store = InMemorySessionStore::new();
        let first = store.get_or_create_session("s1", 1_000).await.unwrap();
        assert_eq!(first.trust_score, 0.0);
        let updated = store
            .update_session_atomic("s1", &mut |s| s.trust_score = 42.0)
            .await
            .unwrap();
        assert_eq!(updated.trust_score, 42.0);
        let reread = store.get_or_create_session("s1", 2_000).await.unwrap();
        assert_eq!(reread.trust_score, 42.0);
    }

    #[tokio::test]
    async fn stream_rate_limit_trips_after_twenty_per_second() {
        let store = InMemorySessionStore::new();
        let mut tripped = false;
        for _ in 0..25 {
            if store.check_stream_rate_limit("s1", 1_000).await {
                tripped = true;
            }
        }
        assert!(tripped);
    }

    #[tokio::test]
    async fn eval_dedup_marks_and_detects() {
        let store = InMemorySessionStore::new();
        assert!(!store.is_eval_processed("e1").await.unwrap());
        store.mark_eval_processed("e1", 1_000).await.unwrap();
        assert!(store.is_eval_processed("e1").await.unwrap());
    }
}
