//! Token usage: pre-flight estimation, post-generation accounting, and the
//! billing ledger.

mod estimator;
mod handler;
mod ledger;

pub use estimator::{
    CHARS_PER_TOKEN, CONTEXT_WINDOW_MESSAGES, DEFAULT_LAST_USAGE, HeuristicEstimator,
    OUTPUT_MULTIPLIER, TokenEstimator, UsageEstimator,
};
pub use handler::{UsageEvent, UsageHandler};
pub use ledger::{MemoryUsageLedger, RecordedUsage, UsageLedger, UsageRecord, billing_period};

use serde::{Deserialize, Serialize};

/// Token counts reported by a model provider. Providers omit fields freely.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_input_tokens: Option<u64>,
}

impl Usage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens: Some(input_tokens),
            output_tokens: Some(output_tokens),
            total_tokens: Some(input_tokens.saturating_add(output_tokens)),
            ..Default::default()
        }
    }

    pub fn with_total(total_tokens: u64) -> Self {
        Self {
            total_tokens: Some(total_tokens),
            ..Default::default()
        }
    }

    /// Reported total, or input + output when the provider left it out.
    pub fn total(&self) -> u64 {
        self.total_tokens.unwrap_or_else(|| {
            self.input_tokens
                .unwrap_or(0)
                .saturating_add(self.output_tokens.unwrap_or(0))
        })
    }
}
