//! Named quotas over a shared state store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::clock::{Clock, SystemClock};
use super::policy::{EvalMode, LimitPolicy, LimitRequest};
use super::store::{MemoryRateLimitStore, RateLimitStore};
use super::{RateLimitError, RateLimitResult};

/// Key used when a quota is shared by everyone.
pub const GLOBAL_KEY: &str = "global";

#[derive(Debug, Clone, Default)]
pub struct LimitArgs {
    key: Option<String>,
    count: Option<f64>,
    reserve: bool,
}

impl LimitArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Per-key quota; omit for the global key.
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn count(mut self, count: f64) -> Self {
        self.count = Some(count);
        self
    }

    /// Allow the counter to go into debt instead of refusing.
    pub fn reserve(mut self) -> Self {
        self.reserve = true;
        self
    }

    fn resolved_key(&self) -> &str {
        self.key.as_deref().unwrap_or(GLOBAL_KEY)
    }

    fn request(&self) -> LimitRequest {
        LimitRequest {
            count: self.count.unwrap_or(1.0),
            reserve: self.reserve,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimitStatus {
    pub ok: bool,
    pub retry_after: Option<Duration>,
}

impl LimitStatus {
    /// Turns a refusal into [`crate::Error::RateLimited`].
    pub fn require(self, limit: &str) -> crate::Result<()> {
        if self.ok {
            Ok(())
        } else {
            Err(crate::Error::RateLimited {
                limit: limit.to_string(),
                retry_after: self.retry_after,
            })
        }
    }
}

/// Current counter of a quota, for clients that want to show when they can
/// act next.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitSnapshot {
    pub limit: String,
    pub key: String,
    pub value: f64,
    pub ts: i64,
    pub policy: LimitPolicy,
    pub server_time: DateTime<Utc>,
}

pub struct RateLimiter {
    limits: HashMap<String, LimitPolicy>,
    store: Arc<dyn RateLimitStore>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(
        limits: impl IntoIterator<Item = (impl Into<String>, LimitPolicy)>,
        store: Arc<dyn RateLimitStore>,
    ) -> Self {
        Self {
            limits: limits.into_iter().map(|(n, p)| (n.into(), p)).collect(),
            store,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn in_memory(limits: impl IntoIterator<Item = (impl Into<String>, LimitPolicy)>) -> Self {
        Self::new(limits, Arc::new(MemoryRateLimitStore::new()))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn policy(&self, name: &str) -> RateLimitResult<&LimitPolicy> {
        self.limits
            .get(name)
            .ok_or_else(|| RateLimitError::UnknownLimit {
                name: name.to_string(),
            })
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn store_name(&self) -> &str {
        self.store.name()
    }

    /// Consumes from the quota when allowed.
    pub async fn limit(&self, name: &str, args: LimitArgs) -> RateLimitResult<LimitStatus> {
        self.apply(name, args, EvalMode::Consume).await
    }

    /// Evaluates the quota without consuming from it.
    pub async fn check(&self, name: &str, args: LimitArgs) -> RateLimitResult<LimitStatus> {
        self.apply(name, args, EvalMode::Check).await
    }

    async fn apply(
        &self,
        name: &str,
        args: LimitArgs,
        mode: EvalMode,
    ) -> RateLimitResult<LimitStatus> {
        let policy = self.policy(name)?;
        let key = args.resolved_key();
        let request = args.request();
        let now = self.clock.now_millis();

        let evaluation = self
            .store
            .evaluate(name, key, policy, request, mode, now)
            .await?;

        tracing::debug!(
            limit = name,
            key = key,
            mode = ?mode,
            count = request.count,
            reserve = request.reserve,
            ok = evaluation.ok,
            remaining = evaluation.state.value,
            "rate limit evaluated"
        );

        Ok(LimitStatus {
            ok: evaluation.ok,
            retry_after: evaluation.retry_after,
        })
    }

    pub async fn status(&self, name: &str, key: Option<&str>) -> RateLimitResult<RateLimitSnapshot> {
        let policy = self.policy(name)?;
        let key = key.unwrap_or(GLOBAL_KEY);
        let now = self.clock.now_millis();
        let state = self.store.snapshot(name, key, policy, now).await?;

        Ok(RateLimitSnapshot {
            limit: name.to_string(),
            key: key.to_string(),
            value: state.value,
            ts: state.ts,
            policy: *policy,
            server_time: self.clock.now(),
        })
    }

    pub async fn reset(&self, name: &str, key: Option<&str>) -> RateLimitResult<()> {
        self.policy(name)?;
        self.store.reset(name, key.unwrap_or(GLOBAL_KEY)).await
    }
}
