//! Pre-flight token estimation.
//!
//! The estimate deliberately over-counts: it charges the whole previous
//! exchange again (its recorded total) on top of the new question and a
//! guessed reply. The real cost is settled after generation by
//! [`super::UsageHandler`].

use std::sync::Arc;

use crate::thread::{ContextQuery, ThreadId, ThreadStore};

pub const CHARS_PER_TOKEN: f64 = 4.0;
pub const OUTPUT_MULTIPLIER: f64 = 3.0;
pub const CONTEXT_WINDOW_MESSAGES: usize = 2;
/// Charged when the thread has no recorded usage yet.
pub const DEFAULT_LAST_USAGE: u64 = 1;

/// Pure estimate from the question text and the last recorded usage.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, question: &str, last_usage: Option<u64>) -> f64;
}

/// Four characters per token, replies three times the prompt plus one.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicEstimator;

impl HeuristicEstimator {
    /// Characters are counted as UTF-16 code units.
    pub fn prompt_tokens(question: &str) -> f64 {
        question.encode_utf16().count() as f64 / CHARS_PER_TOKEN
    }
}

impl TokenEstimator for HeuristicEstimator {
    fn estimate(&self, question: &str, last_usage: Option<u64>) -> f64 {
        let prompt_tokens = Self::prompt_tokens(question);
        let estimated_output_tokens = prompt_tokens * OUTPUT_MULTIPLIER + 1.0;
        let last_prompt_tokens = last_usage.unwrap_or(DEFAULT_LAST_USAGE) as f64;
        last_prompt_tokens + prompt_tokens + estimated_output_tokens
    }
}

/// Combines a [`TokenEstimator`] with the recent context of a thread.
pub struct UsageEstimator {
    threads: Arc<dyn ThreadStore>,
    estimator: Arc<dyn TokenEstimator>,
    recent_messages: usize,
}

impl UsageEstimator {
    pub fn new(threads: Arc<dyn ThreadStore>) -> Self {
        Self {
            threads,
            estimator: Arc::new(HeuristicEstimator),
            recent_messages: CONTEXT_WINDOW_MESSAGES,
        }
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn with_recent_messages(mut self, recent_messages: usize) -> Self {
        self.recent_messages = recent_messages;
        self
    }

    /// Total tokens of the newest recent message that has usage recorded.
    ///
    /// A failed context fetch counts as no history.
    pub async fn last_usage(&self, thread_id: Option<&ThreadId>, user_id: Option<&str>) -> Option<u64> {
        let thread_id = thread_id.copied()?;
        let query = ContextQuery::recent(Some(thread_id), self.recent_messages).for_user(user_id);

        let messages = match self.threads.context_messages(&query).await {
            Ok(messages) => messages,
            Err(e) => {
                tracing::warn!(
                    thread_id = %thread_id,
                    error = %e,
                    "Context fetch failed; estimating without history"
                );
                return None;
            }
        };

        messages
            .iter()
            .rev()
            .find_map(|m| m.usage)
            .map(|usage| usage.total_tokens.unwrap_or(DEFAULT_LAST_USAGE))
    }

    pub async fn estimate(
        &self,
        thread_id: Option<&ThreadId>,
        user_id: Option<&str>,
        question: &str,
    ) -> f64 {
        let last_usage = self.last_usage(thread_id, user_id).await;
        let estimate = self.estimator.estimate(question, last_usage);
        tracing::debug!(
            last_usage = ?last_usage,
            question_len = question.len(),
            estimate = estimate,
            "Estimated token usage"
        );
        estimate
    }
}
