//! Admission of new questions.
//!
//! A question is admitted only after it passes, in order: authentication,
//! thread access, the per-user and global send quotas, and a reserve check of
//! its estimated cost against the per-user and global token quotas. Send
//! quotas are consumed on the way; token quotas are only checked here and
//! charged once the real usage is known (see [`crate::usage::UsageHandler`]).

use std::sync::Arc;

use serde::Serialize;

use crate::config::{GLOBAL_SEND_MESSAGE, GLOBAL_TOKEN_USAGE, SEND_MESSAGE, TOKEN_USAGE_PER_USER};
use crate::metrics::GateMetrics;
use crate::ratelimit::{LimitArgs, RateLimitSnapshot, RateLimiter};
use crate::scheduler::{GenerationTask, Scheduler};
use crate::thread::{MessageId, ThreadId, ThreadMessage, ThreadStore, authorize_thread_access};
use crate::usage::{TokenEstimator, UsageEstimator};
use crate::{Error, Result};

/// An accepted question, persisted and queued for generation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Admission {
    pub message_id: MessageId,
    pub thread_id: ThreadId,
    pub estimated_tokens: f64,
}

pub struct ChatGate {
    limiter: Arc<RateLimiter>,
    threads: Arc<dyn ThreadStore>,
    scheduler: Arc<dyn Scheduler>,
    estimator: UsageEstimator,
    metrics: Arc<GateMetrics>,
}

impl ChatGate {
    pub fn new(
        limiter: Arc<RateLimiter>,
        threads: Arc<dyn ThreadStore>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        Self {
            estimator: UsageEstimator::new(threads.clone()),
            limiter,
            threads,
            scheduler,
            metrics: Arc::new(GateMetrics::new()),
        }
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = self.estimator.with_estimator(estimator);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<GateMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn metrics(&self) -> &Arc<GateMetrics> {
        &self.metrics
    }

    /// Admits `question` into `thread_id` or explains why not.
    ///
    /// Nothing is persisted or scheduled unless every gate passes, and a
    /// question the scheduler refuses is removed again.
    #[tracing::instrument(
        skip_all,
        fields(user_id = ?user_id, thread_id = %thread_id, question_len = question.len())
    )]
    pub async fn submit_question(
        &self,
        user_id: Option<&str>,
        thread_id: &ThreadId,
        question: &str,
    ) -> Result<Admission> {
        let result = self.admit(user_id, thread_id, question).await;
        match &result {
            Ok(admission) => {
                self.metrics.record_admission(admission.estimated_tokens);
                tracing::debug!(
                    message_id = %admission.message_id,
                    estimated_tokens = admission.estimated_tokens,
                    "Question admitted"
                );
            }
            Err(e) => {
                self.metrics.record_rejection(e);
                tracing::warn!(error = %e, "Question rejected");
            }
        }
        result
    }

    async fn admit(
        &self,
        user_id: Option<&str>,
        thread_id: &ThreadId,
        question: &str,
    ) -> Result<Admission> {
        let user_id = user_id.ok_or(Error::Unauthorized)?;
        authorize_thread_access(self.threads.as_ref(), user_id, thread_id).await?;

        self.limiter
            .limit(SEND_MESSAGE, LimitArgs::new().key(user_id))
            .await?
            .require(SEND_MESSAGE)?;
        self.limiter
            .limit(GLOBAL_SEND_MESSAGE, LimitArgs::new())
            .await?
            .require(GLOBAL_SEND_MESSAGE)?;

        let estimated_tokens = self
            .estimator
            .estimate(Some(thread_id), Some(user_id), question)
            .await;

        self.limiter
            .check(
                TOKEN_USAGE_PER_USER,
                LimitArgs::new().key(user_id).count(estimated_tokens).reserve(),
            )
            .await?
            .require(TOKEN_USAGE_PER_USER)?;
        self.limiter
            .check(
                GLOBAL_TOKEN_USAGE,
                LimitArgs::new().count(estimated_tokens).reserve(),
            )
            .await?
            .require(GLOBAL_TOKEN_USAGE)?;

        let message_id = self
            .threads
            .save_message(ThreadMessage::user(
                *thread_id,
                Some(user_id.to_string()),
                question,
            ))
            .await?;
        let task = GenerationTask {
            thread_id: *thread_id,
            prompt_message_id: message_id.clone(),
        };
        if let Err(e) = self.scheduler.schedule(task).await {
            // An unscheduled question would never get a reply.
            if let Err(delete_err) = self.threads.delete_message(&message_id).await {
                tracing::warn!(
                    message_id = %message_id,
                    error = %delete_err,
                    "Failed to remove unscheduled question"
                );
            }
            return Err(e);
        }

        Ok(Admission {
            message_id,
            thread_id: *thread_id,
            estimated_tokens,
        })
    }

    /// What the next question would cost before counting its own text.
    pub async fn previous_usage(&self, user_id: Option<&str>, thread_id: Option<&ThreadId>) -> f64 {
        self.estimator.estimate(thread_id, user_id, "").await
    }

    /// The caller's send-message counter, so a client can tell when it may
    /// send next.
    pub async fn send_status(&self, user_id: Option<&str>) -> Result<RateLimitSnapshot> {
        let user_id = user_id.ok_or(Error::Unauthorized)?;
        Ok(self.limiter.status(SEND_MESSAGE, Some(user_id)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimitsConfig;
    use crate::ratelimit::ManualClock;
    use crate::thread::{MemoryThreadStore, Thread};
    use std::time::Duration;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        tasks: Mutex<Vec<GenerationTask>>,
    }

    #[async_trait::async_trait]
    impl Scheduler for Recording {
        async fn schedule(&self, task: GenerationTask) -> Result<()> {
            self.tasks.lock().await.push(task);
            Ok(())
        }
    }

    async fn gate() -> (ChatGate, MemoryThreadStore, Arc<Recording>, ThreadId) {
        let threads = MemoryThreadStore::new();
        let thread = threads
            .create_thread(Thread::new(Some("alice".into())))
            .await
            .unwrap();
        let scheduler = Arc::new(Recording::default());
        let limiter = Arc::new(
            RateLimiter::in_memory(LimitsConfig::default().entries())
                .with_clock(Arc::new(ManualClock::new(0))),
        );
        let gate = ChatGate::new(limiter, Arc::new(threads.clone()), scheduler.clone());
        (gate, threads, scheduler, thread.id)
    }

    #[tokio::test]
    async fn test_admission_persists_and_schedules() {
        let (gate, threads, scheduler, thread_id) = gate().await;

        let admission = gate
            .submit_question(Some("alice"), &thread_id, &"q".repeat(40))
            .await
            .unwrap();
        assert_eq!(admission.estimated_tokens, 42.0);

        let saved = threads.get_message(&admission.message_id).await.unwrap().unwrap();
        assert_eq!(saved.user_id.as_deref(), Some("alice"));

        let tasks = scheduler.tasks.lock().await;
        assert_eq!(
            *tasks,
            vec![GenerationTask {
                thread_id,
                prompt_message_id: admission.message_id.clone(),
            }]
        );
        assert_eq!(gate.metrics().admitted.get(), 1);
    }

    struct Closed;

    #[async_trait::async_trait]
    impl Scheduler for Closed {
        async fn schedule(&self, _task: GenerationTask) -> Result<()> {
            Err(Error::SchedulerClosed)
        }
    }

    #[tokio::test]
    async fn test_schedule_failure_removes_question() {
        let (_gate, threads, _scheduler, thread_id) = gate().await;
        let limiter = Arc::new(RateLimiter::in_memory(LimitsConfig::default().entries()));
        let gate = ChatGate::new(limiter, Arc::new(threads.clone()), Arc::new(Closed));

        let err = gate
            .submit_question(Some("alice"), &thread_id, "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SchedulerClosed));
        assert_eq!(threads.message_count(&thread_id).await, 0);
        assert!(threads.messages(&thread_id).await.is_empty());
        assert_eq!(gate.metrics().admitted.get(), 0);
    }

    #[tokio::test]
    async fn test_anonymous_rejected() {
        let (gate, threads, scheduler, thread_id) = gate().await;

        let err = gate.submit_question(None, &thread_id, "hi").await.unwrap_err();
        assert!(err.is_unauthorized());
        assert_eq!(threads.message_count(&thread_id).await, 0);
        assert!(scheduler.tasks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_foreign_thread_rejected_before_quota() {
        let (gate, _threads, _scheduler, thread_id) = gate().await;

        let err = gate
            .submit_question(Some("mallory"), &thread_id, "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden { .. }));

        let status = gate.send_status(Some("mallory")).await.unwrap();
        assert_eq!(status.value, 2.0);

        let missing = gate
            .submit_question(Some("alice"), &ThreadId::new(), "hi")
            .await
            .unwrap_err();
        assert!(matches!(missing, Error::ThreadNotFound { .. }));
    }

    #[tokio::test]
    async fn test_third_message_in_window_rate_limited() {
        let (gate, _threads, _scheduler, thread_id) = gate().await;

        for _ in 0..2 {
            gate.submit_question(Some("alice"), &thread_id, "hi")
                .await
                .unwrap();
        }
        let err = gate
            .submit_question(Some("alice"), &thread_id, "hi")
            .await
            .unwrap_err();
        assert!(err.is_rate_limited());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(5)));
        assert_eq!(gate.metrics().rejected_rate_limited.get(), 1);
    }

    #[tokio::test]
    async fn test_previous_usage_and_send_status() {
        let (gate, _threads, _scheduler, thread_id) = gate().await;

        assert_eq!(gate.previous_usage(Some("alice"), Some(&thread_id)).await, 2.0);
        assert_eq!(gate.previous_usage(None, None).await, 2.0);

        gate.submit_question(Some("alice"), &thread_id, "hi")
            .await
            .unwrap();
        let status = gate.send_status(Some("alice")).await.unwrap();
        assert_eq!(status.limit, SEND_MESSAGE);
        assert_eq!(status.value, 1.0);

        assert!(gate.send_status(None).await.unwrap_err().is_unauthorized());
    }
}
