//! Redis primitives backing the admission guards.
//!
//! All limiter state mutates through three atomic operations so that counts
//! stay correct under concurrent access from multiple service instances:
//!
//! - a sliding-window counter (Lua over two adjacent window buckets),
//! - token-bucket state (Lua over a small hash),
//! - `SET NX EX` / `DEL` for single-flight locks.

use crate::config::RedisConfig;
use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::info;

/// Outcome of a limiter check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitDecision {
    /// Whether the request is admitted
    pub allowed: bool,
    /// Permits left after this request (0 when rejected)
    pub remaining: u64,
    /// Unix milliseconds at which the window resets or the next token refills
    pub reset_ms: u64,
}

/// Sliding-window counter over two adjacent fixed buckets.
///
/// The previous bucket's count is weighted by how much of it still overlaps
/// the trailing window, which approximates a true sliding window without
/// storing per-request timestamps.
const SLIDING_WINDOW_LUA: &str = r#"
local current_key  = KEYS[1]
local previous_key = KEYS[2]
local max_requests = tonumber(ARGV[1])
local now_ms       = tonumber(ARGV[2])
local window_ms    = tonumber(ARGV[3])

local current  = tonumber(redis.call("GET", current_key) or "0")
local previous = tonumber(redis.call("GET", previous_key) or "0")

local elapsed = (now_ms % window_ms) / window_ms
local count = previous * (1 - elapsed) + current
local reset_ms = (math.floor(now_ms / window_ms) + 1) * window_ms

if count >= max_requests then
  return {0, 0, reset_ms}
end

current = redis.call("INCR", current_key)
if current == 1 then
  redis.call("PEXPIRE", current_key, window_ms * 2)
end

local remaining = max_requests - (previous * (1 - elapsed) + current)
if remaining < 0 then remaining = 0 end
return {1, math.floor(remaining), reset_ms}
"#;

/// Token bucket refilling one token per interval up to capacity.
const TOKEN_BUCKET_LUA: &str = r#"
local key         = KEYS[1]
local capacity    = tonumber(ARGV[1])
local interval_ms = tonumber(ARGV[2])
local now_ms      = tonumber(ARGV[3])

local state = redis.call("HMGET", key, "refilled_at", "tokens")
local refilled_at
local tokens
if state[1] == false then
  refilled_at = now_ms
  tokens = capacity
else
  refilled_at = tonumber(state[1])
  tokens = tonumber(state[2])
end

if now_ms >= refilled_at + interval_ms then
  local refills = math.floor((now_ms - refilled_at) / interval_ms)
  tokens = math.min(capacity, tokens + refills)
  refilled_at = refilled_at + refills * interval_ms
end

if tokens == 0 then
  return {0, 0, refilled_at + interval_ms}
end

tokens = tokens - 1
redis.call("HSET", key, "refilled_at", refilled_at, "tokens", tokens)
redis.call("PEXPIRE", key, (capacity - tokens) * interval_ms + interval_ms)
return {1, tokens, refilled_at + interval_ms}
"#;

/// Thin client over the shared Redis instance.
#[derive(Clone)]
pub struct KvStore {
    conn: ConnectionManager,
    sliding_window: Script,
    token_bucket: Script,
}

impl KvStore {
    /// Connect to Redis and prepare the limiter scripts.
    pub async fn new(config: &RedisConfig) -> Result<Self> {
        let client =
            redis::Client::open(config.url.as_str()).context("Invalid Redis URL")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;

        info!("Connected to Redis");

        Ok(Self {
            conn,
            sliding_window: Script::new(SLIDING_WINDOW_LUA),
            token_bucket: Script::new(TOKEN_BUCKET_LUA),
        })
    }

    /// Atomically count a request against a sliding window.
    pub async fn check_sliding_window(
        &self,
        key: &str,
        max_requests: u32,
        window_ms: u64,
        now_ms: u64,
    ) -> Result<LimitDecision, redis::RedisError> {
        let (current_key, previous_key) = window_bucket_keys(key, window_ms, now_ms);
        let mut conn = self.conn.clone();

        let (allowed, remaining, reset_ms): (u8, u64, u64) = self
            .sliding_window
            .key(current_key)
            .key(previous_key)
            .arg(max_requests)
            .arg(now_ms)
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await?;

        Ok(LimitDecision {
            allowed: allowed == 1,
            remaining,
            reset_ms,
        })
    }

    /// Atomically take one token from a bucket, refilling first.
    pub async fn check_token_bucket(
        &self,
        key: &str,
        capacity: u32,
        refill_interval_ms: u64,
        now_ms: u64,
    ) -> Result<LimitDecision, redis::RedisError> {
        let mut conn = self.conn.clone();

        let (allowed, remaining, reset_ms): (u8, u64, u64) = self
            .token_bucket
            .key(key)
            .arg(capacity)
            .arg(refill_interval_ms)
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await?;

        Ok(LimitDecision {
            allowed: allowed == 1,
            remaining,
            reset_ms,
        })
    }

    /// `SET key NX EX ttl`. Returns true if the lock was acquired.
    pub async fn acquire_lock(
        &self,
        key: &str,
        ttl_secs: u64,
    ) -> Result<bool, redis::RedisError> {
        let mut conn = self.conn.clone();
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(result.is_some())
    }

    /// Delete a lock key. Safe to call for a key that no longer exists.
    pub async fn release_lock(&self, key: &str) -> Result<(), redis::RedisError> {
        let mut conn = self.conn.clone();
        let _: u64 = conn.del(key).await?;
        Ok(())
    }

    /// Connectivity probe for readiness checks.
    pub async fn ping(&self) -> Result<(), redis::RedisError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

/// Keys for the current and previous window bucket of a sliding window.
fn window_bucket_keys(key: &str, window_ms: u64, now_ms: u64) -> (String, String) {
    let bucket = now_ms / window_ms;
    (
        format!("{}:{}", key, bucket),
        format!("{}:{}", key, bucket.wrapping_sub(1)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_bucket_keys_adjacent() {
        let (current, previous) = window_bucket_keys("rl:sw:preview:1.2.3.4", 60_000, 125_000);
        assert_eq!(current, "rl:sw:preview:1.2.3.4:2");
        assert_eq!(previous, "rl:sw:preview:1.2.3.4:1");
    }

    #[test]
    fn test_window_bucket_rolls_over() {
        let window_ms = 3_600_000u64;
        let now = 7_200_000u64;
        let (current, _) = window_bucket_keys("k", window_ms, now);
        let (next_current, next_previous) = window_bucket_keys("k", window_ms, now + window_ms);
        assert_eq!(current, "k:2");
        assert_eq!(next_current, "k:3");
        assert_eq!(next_previous, current);
    }

    #[test]
    fn test_limiter_scripts_construct() {
        // Creating a Script computes its SHA without needing a server.
        let _ = Script::new(SLIDING_WINDOW_LUA);
        let _ = Script::new(TOKEN_BUCKET_LUA);
    }
}
