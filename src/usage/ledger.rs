//! Raw usage records for billing.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::Usage;
use crate::thread::ThreadId;

/// First day of the month of `at`, as `YYYY-MM-01` (UTC).
pub fn billing_period(at: DateTime<Utc>) -> String {
    format!("{:04}-{:02}-01", at.year(), at.month())
}

/// Usage with provider gaps filled in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_input_tokens: Option<u64>,
}

impl From<Usage> for RecordedUsage {
    fn from(usage: Usage) -> Self {
        Self {
            prompt_tokens: usage.input_tokens.unwrap_or(0),
            completion_tokens: usage.output_tokens.unwrap_or(0),
            total_tokens: usage.total_tokens.unwrap_or(0),
            reasoning_tokens: usage.reasoning_tokens,
            cached_input_tokens: usage.cached_input_tokens,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: Uuid,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<ThreadId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    pub model: String,
    pub provider: String,
    pub usage: RecordedUsage,
    pub billing_period: String,
    pub recorded_at: DateTime<Utc>,
}

impl UsageRecord {
    pub fn new(
        user_id: impl Into<String>,
        model: impl Into<String>,
        provider: impl Into<String>,
        usage: Usage,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            thread_id: None,
            agent_name: None,
            model: model.into(),
            provider: provider.into(),
            usage: usage.into(),
            billing_period: billing_period(recorded_at),
            recorded_at,
        }
    }

    pub fn with_thread(mut self, thread_id: ThreadId) -> Self {
        self.thread_id = Some(thread_id);
        self
    }

    pub fn with_agent_name(mut self, agent_name: Option<String>) -> Self {
        self.agent_name = agent_name;
        self
    }
}

#[async_trait::async_trait]
pub trait UsageLedger: Send + Sync {
    async fn insert(&self, record: UsageRecord) -> crate::Result<()>;

    async fn records_for(&self, user_id: &str, billing_period: &str) -> crate::Result<Vec<UsageRecord>>;
}

#[derive(Debug, Default, Clone)]
pub struct MemoryUsageLedger {
    records: Arc<RwLock<Vec<UsageRecord>>>,
}

impl MemoryUsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<UsageRecord> {
        self.records.read().await.clone()
    }

    pub async fn total_tokens(&self, user_id: &str, billing_period: &str) -> u64 {
        self.records
            .read()
            .await
            .iter()
            .filter(|r| r.user_id == user_id && r.billing_period == billing_period)
            .map(|r| r.usage.total_tokens)
            .sum()
    }
}

#[async_trait::async_trait]
impl UsageLedger for MemoryUsageLedger {
    async fn insert(&self, record: UsageRecord) -> crate::Result<()> {
        self.records.write().await.push(record);
        Ok(())
    }

    async fn records_for(&self, user_id: &str, billing_period: &str) -> crate::Result<Vec<UsageRecord>> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .filter(|r| r.user_id == user_id && r.billing_period == billing_period)
            .cloned()
            .collect())
    }
}
