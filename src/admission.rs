//! Admission guards: sliding-window limiter, token-bucket limiter, and the
//! per-identity single-flight lock.
//!
//! The three guards are independent and composable per route. The sliding
//! window bounds abuse from any single client identity; the token bucket is
//! global admission control shielding downstream storage and database work;
//! the single-flight lock serializes mutations per authenticated user.
//!
//! Limiter instances live in a lazily-populated registry owned by the
//! [`Admission`] value, which is constructed once and injected where needed.

use crate::config::{SlidingWindowConfig, TokenBucketConfig};
use crate::error::AppError;
use crate::kv::{KvStore, LimitDecision};
use chrono::Utc;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

/// Who is asking. Derived from request headers by the API layer.
#[derive(Debug, Clone, Default)]
pub struct Identity {
    /// Originating client IP (first hop of x-forwarded-for)
    pub client_ip: Option<String>,
    /// Authenticated user, when the upstream auth proxy vouched for one
    pub user_id: Option<String>,
}

/// Predicate deciding whether a sliding-window check should be skipped
/// for a particular request.
pub type SkipPredicate = dyn Fn(&Identity) -> bool + Send + Sync;

/// A sliding-window limiter bound to one route.
#[derive(Debug)]
struct SlidingWindow {
    route_key: String,
    max_requests: u32,
    window: Duration,
    guest_only: bool,
}

/// A token-bucket limiter bound to one route.
#[derive(Debug)]
struct TokenBucket {
    route_key: String,
    capacity: u32,
    refill_interval: Duration,
}

/// Lazily-populated, thread-safe registry of limiter instances keyed by
/// route. Process-lifetime scoped; no ambient module state.
#[derive(Default)]
struct LimiterRegistry {
    windows: RwLock<HashMap<String, Arc<SlidingWindow>>>,
    buckets: RwLock<HashMap<String, Arc<TokenBucket>>>,
}

impl LimiterRegistry {
    fn sliding_window(
        &self,
        route_key: &str,
        config: &SlidingWindowConfig,
    ) -> Option<Arc<SlidingWindow>> {
        let (max_requests, window_secs, guest_only) = match config {
            SlidingWindowConfig::Enabled {
                max_requests,
                window_secs,
                guest_only,
            } => (*max_requests, *window_secs, *guest_only),
            SlidingWindowConfig::Disabled => return None,
        };

        if let Some(limiter) = self.windows.read().unwrap().get(route_key) {
            return Some(limiter.clone());
        }

        let mut windows = self.windows.write().unwrap();
        Some(
            windows
                .entry(route_key.to_string())
                .or_insert_with(|| {
                    Arc::new(SlidingWindow {
                        route_key: route_key.to_string(),
                        max_requests,
                        window: Duration::from_secs(window_secs),
                        guest_only,
                    })
                })
                .clone(),
        )
    }

    fn token_bucket(
        &self,
        route_key: &str,
        config: &TokenBucketConfig,
    ) -> Option<Arc<TokenBucket>> {
        let (capacity, refill_secs) = match config {
            TokenBucketConfig::Enabled {
                capacity,
                refill_secs,
            } => (*capacity, *refill_secs),
            TokenBucketConfig::Disabled => return None,
        };

        if let Some(limiter) = self.buckets.read().unwrap().get(route_key) {
            return Some(limiter.clone());
        }

        let mut buckets = self.buckets.write().unwrap();
        Some(
            buckets
                .entry(route_key.to_string())
                .or_insert_with(|| {
                    Arc::new(TokenBucket {
                        route_key: route_key.to_string(),
                        capacity,
                        refill_interval: Duration::from_secs(refill_secs),
                    })
                })
                .clone(),
        )
    }
}

/// Admission component shared across request handlers.
pub struct Admission {
    kv: KvStore,
    registry: LimiterRegistry,
    lock_ttl: Duration,
}

impl Admission {
    pub fn new(kv: KvStore, lock_ttl: Duration) -> Self {
        Self {
            kv,
            registry: LimiterRegistry::default(),
            lock_ttl,
        }
    }

    /// Per-client sliding-window check.
    ///
    /// Skipped entirely when the guard is disabled, when `guest_only` is set
    /// and the caller is authenticated, or when `skip_if` says so. A missing
    /// client IP on an enabled guard is an input error, not a silent pass.
    pub async fn check_sliding_window(
        &self,
        route_key: &str,
        config: &SlidingWindowConfig,
        identity: &Identity,
        skip_if: Option<&SkipPredicate>,
    ) -> Result<(), AppError> {
        let Some(limiter) = self.registry.sliding_window(route_key, config) else {
            return Ok(());
        };

        if limiter.guest_only && identity.user_id.is_some() {
            return Ok(());
        }
        if let Some(skip) = skip_if {
            if skip(identity) {
                return Ok(());
            }
        }

        let ip = identity
            .client_ip
            .as_deref()
            .ok_or_else(|| AppError::Validation("Missing IP address".to_string()))?;

        let now_ms = Utc::now().timestamp_millis() as u64;
        let key = format!("rl:sw:{}:{}", limiter.route_key, ip);
        let decision = self
            .kv
            .check_sliding_window(
                &key,
                limiter.max_requests,
                limiter.window.as_millis() as u64,
                now_ms,
            )
            .await?;

        if decision.allowed {
            debug!(
                route = %limiter.route_key,
                remaining = decision.remaining,
                "Sliding window admitted request"
            );
            return Ok(());
        }

        metrics::counter!("pagedrop.admission.rejected", "guard" => "sliding_window")
            .increment(1);
        Err(AppError::RateLimited {
            retry_after_secs: retry_after_secs(&decision, now_ms),
        })
    }

    /// Global token-bucket check for a route.
    pub async fn check_token_bucket(
        &self,
        route_key: &str,
        config: &TokenBucketConfig,
    ) -> Result<(), AppError> {
        let Some(limiter) = self.registry.token_bucket(route_key, config) else {
            return Ok(());
        };

        let now_ms = Utc::now().timestamp_millis() as u64;
        let key = format!("rl:tb:{}", limiter.route_key);
        let decision = self
            .kv
            .check_token_bucket(
                &key,
                limiter.capacity,
                limiter.refill_interval.as_millis() as u64,
                now_ms,
            )
            .await?;

        if decision.allowed {
            debug!(
                route = %limiter.route_key,
                remaining = decision.remaining,
                "Token bucket admitted request"
            );
            return Ok(());
        }

        metrics::counter!("pagedrop.admission.rejected", "guard" => "token_bucket")
            .increment(1);
        Err(AppError::Busy {
            retry_after_secs: retry_after_secs(&decision, now_ms),
        })
    }

    /// Run `op` while holding the single-flight lock for `(user, route)`.
    ///
    /// The lock is taken with `SET NX EX`; a second caller for the same user
    /// and route is rejected immediately with no queueing. The key is deleted
    /// on completion whether `op` succeeded or failed; the TTL is only a
    /// safety net for a crashed holder.
    pub async fn with_single_flight<F, T>(
        &self,
        user_id: &str,
        route_key: &str,
        op: F,
    ) -> Result<T, AppError>
    where
        F: Future<Output = Result<T, AppError>>,
    {
        if user_id.is_empty() {
            return Err(AppError::Unauthorized);
        }

        let key = lock_key(user_id, route_key);
        let acquired = self.kv.acquire_lock(&key, self.lock_ttl.as_secs()).await?;
        if !acquired {
            metrics::counter!("pagedrop.admission.rejected", "guard" => "single_flight")
                .increment(1);
            return Err(AppError::LockContention);
        }

        let result = op.await;

        if let Err(e) = self.kv.release_lock(&key).await {
            // The TTL will reap the key; the next attempt inside the TTL
            // window is rejected, which is the accepted failure mode.
            warn!(error = %e, key = %key, "Failed to release single-flight lock");
        }

        result
    }
}

/// Lock key for a single-flight guard.
fn lock_key(user_id: &str, route_key: &str) -> String {
    format!("user-concurrent:{}:{}", user_id, route_key)
}

/// Whole seconds until a limiter resets, rounded up, at least 1.
fn retry_after_secs(decision: &LimitDecision, now_ms: u64) -> u64 {
    let wait_ms = decision.reset_ms.saturating_sub(now_ms);
    wait_ms.div_ceil(1000).max(1)
}
