//! Settles actual token usage after a generation finishes.

use std::sync::Arc;

use super::Usage;
use super::ledger::{UsageLedger, UsageRecord};
use crate::config::{GLOBAL_TOKEN_USAGE, TOKEN_USAGE_PER_USER};
use crate::metrics::GateMetrics;
use crate::ratelimit::{LimitArgs, RateLimiter};
use crate::thread::ThreadId;

/// Usage reported for one completed generation.
#[derive(Debug, Clone)]
pub struct UsageEvent {
    pub user_id: Option<String>,
    pub thread_id: Option<ThreadId>,
    pub agent_name: Option<String>,
    pub model: String,
    pub provider: String,
    pub usage: Usage,
}

pub struct UsageHandler {
    limiter: Arc<RateLimiter>,
    ledger: Arc<dyn UsageLedger>,
    metrics: Arc<GateMetrics>,
}

impl UsageHandler {
    pub fn new(limiter: Arc<RateLimiter>, ledger: Arc<dyn UsageLedger>) -> Self {
        Self {
            limiter,
            ledger,
            metrics: Arc::new(GateMetrics::new()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<GateMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Charges the token quotas with reserve and writes a billing record.
    ///
    /// Returns `None` for anonymous usage, which is neither charged nor
    /// recorded.
    pub async fn handle(&self, event: UsageEvent) -> crate::Result<Option<UsageRecord>> {
        let Some(user_id) = event.user_id.as_deref() else {
            tracing::warn!(
                model = %event.model,
                "Not tracking usage for anonymous user"
            );
            self.metrics.anonymous_usage_skipped.inc();
            return Ok(None);
        };

        let total = event.usage.total();
        if total > 0 {
            self.consume(TOKEN_USAGE_PER_USER, Some(user_id), total).await?;
            self.consume(GLOBAL_TOKEN_USAGE, None, total).await?;
            self.metrics.record_tokens(total);
        }

        let mut record = UsageRecord::new(
            user_id,
            event.model,
            event.provider,
            event.usage,
            self.limiter.clock().now(),
        )
        .with_agent_name(event.agent_name);
        if let Some(thread_id) = event.thread_id {
            record = record.with_thread(thread_id);
        }

        self.ledger.insert(record.clone()).await?;
        tracing::debug!(
            user_id = %record.user_id,
            total_tokens = total,
            billing_period = %record.billing_period,
            "Recorded usage"
        );
        Ok(Some(record))
    }

    /// Reserve consumption always succeeds; usage past the quota is carried
    /// as debt that the next pre-flight check refuses on.
    async fn consume(&self, limit: &str, key: Option<&str>, total: u64) -> crate::Result<()> {
        let mut args = LimitArgs::new().count(total as f64).reserve();
        if let Some(key) = key {
            args = args.key(key);
        }
        self.limiter.limit(limit, args).await?;
        Ok(())
    }
}
