//! Rate limit state backends.
//!
//! A store owns the per-(limit, key) counters and must evaluate a request
//! against them atomically: concurrent consumers of the same key never observe
//! each other's half-applied updates.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::StoreResult;
use super::policy::{BucketState, EvalMode, Evaluation, LimitPolicy, LimitRequest};

#[async_trait::async_trait]
pub trait RateLimitStore: Send + Sync {
    fn name(&self) -> &str;

    async fn evaluate(
        &self,
        limit: &str,
        key: &str,
        policy: &LimitPolicy,
        request: LimitRequest,
        mode: EvalMode,
        now: i64,
    ) -> StoreResult<Evaluation>;

    /// Stored state replenished to `now`. Does not write.
    async fn snapshot(
        &self,
        limit: &str,
        key: &str,
        policy: &LimitPolicy,
        now: i64,
    ) -> StoreResult<BucketState>;

    async fn reset(&self, limit: &str, key: &str) -> StoreResult<()>;
}

/// Process-local store for tests and single-instance deployments.
#[derive(Debug, Default)]
pub struct MemoryRateLimitStore {
    states: DashMap<(String, String), BucketState>,
}

impl MemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    fn slot(limit: &str, key: &str) -> (String, String) {
        (limit.to_string(), key.to_string())
    }
}

#[async_trait::async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn evaluate(
        &self,
        limit: &str,
        key: &str,
        policy: &LimitPolicy,
        request: LimitRequest,
        mode: EvalMode,
        now: i64,
    ) -> StoreResult<Evaluation> {
        if mode == EvalMode::Check {
            let stored = self.states.get(&Self::slot(limit, key)).map(|s| *s);
            return Ok(policy.evaluate(stored, request, mode, now));
        }

        // The entry guard holds the shard lock across read-evaluate-write.
        let evaluation = match self.states.entry(Self::slot(limit, key)) {
            Entry::Occupied(mut entry) => {
                let evaluation = policy.evaluate(Some(*entry.get()), request, mode, now);
                if evaluation.ok {
                    *entry.get_mut() = evaluation.state;
                }
                evaluation
            }
            Entry::Vacant(entry) => {
                let evaluation = policy.evaluate(None, request, mode, now);
                if evaluation.ok {
                    entry.insert(evaluation.state);
                }
                evaluation
            }
        };
        Ok(evaluation)
    }

    async fn snapshot(
        &self,
        limit: &str,
        key: &str,
        policy: &LimitPolicy,
        now: i64,
    ) -> StoreResult<BucketState> {
        let stored = self.states.get(&Self::slot(limit, key)).map(|s| *s);
        Ok(policy.replenish(stored, now))
    }

    async fn reset(&self, limit: &str, key: &str) -> StoreResult<()> {
        self.states.remove(&Self::slot(limit, key));
        Ok(())
    }
}
