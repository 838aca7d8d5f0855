//! Hand-off of admitted questions to reply generation.
//!
//! Admission only enqueues a [`GenerationTask`]; a worker drains the queue and
//! runs each task through a [`TaskHandler`], normally a
//! [`GenerationPipeline`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tokio::task::{JoinHandle, JoinSet};

use crate::metrics::GateMetrics;
use crate::thread::{MessageId, Thread, ThreadError, ThreadId, ThreadMessage, ThreadStore};
use crate::usage::{Usage, UsageEvent, UsageHandler};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationTask {
    pub thread_id: ThreadId,
    pub prompt_message_id: MessageId,
}

#[async_trait::async_trait]
pub trait Scheduler: Send + Sync {
    /// Enqueues `task`; does not wait for it to run.
    async fn schedule(&self, task: GenerationTask) -> Result<()>;
}

#[async_trait::async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn run(&self, task: GenerationTask);
}

/// In-process queue drained by a background worker.
pub struct TokioScheduler {
    sender: Mutex<Option<mpsc::UnboundedSender<GenerationTask>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TokioScheduler {
    /// Starts the worker; must be called inside a tokio runtime.
    pub fn spawn(handler: Arc<dyn TaskHandler>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = tokio::spawn(Self::drain(receiver, handler));
        Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        }
    }

    async fn drain(
        mut receiver: mpsc::UnboundedReceiver<GenerationTask>,
        handler: Arc<dyn TaskHandler>,
    ) {
        let mut running = JoinSet::new();
        loop {
            tokio::select! {
                task = receiver.recv() => match task {
                    Some(task) => {
                        let handler = handler.clone();
                        running.spawn(async move { handler.run(task).await });
                    }
                    None => break,
                },
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    Self::log_join(joined);
                }
            }
        }

        while let Some(joined) = running.join_next().await {
            Self::log_join(joined);
        }
    }

    fn log_join(joined: std::result::Result<(), tokio::task::JoinError>) {
        if let Err(e) = joined {
            tracing::error!(error = %e, "Generation task aborted");
        }
    }

    /// Closes the queue and waits for every accepted task to finish.
    pub async fn shutdown(&self) {
        self.sender.lock().await.take();
        if let Some(worker) = self.worker.lock().await.take()
            && let Err(e) = worker.await
        {
            tracing::error!(error = %e, "Scheduler worker aborted");
        }
    }
}

#[async_trait::async_trait]
impl Scheduler for TokioScheduler {
    async fn schedule(&self, task: GenerationTask) -> Result<()> {
        let sender = self.sender.lock().await;
        let Some(sender) = sender.as_ref() else {
            return Err(Error::SchedulerClosed);
        };
        sender.send(task).map_err(|_| Error::SchedulerClosed)
    }
}

/// Reply produced by the agent runtime.
#[derive(Debug, Clone)]
pub struct GeneratedReply {
    pub text: String,
    pub usage: Usage,
    pub model: String,
    pub provider: String,
    pub agent_name: Option<String>,
}

#[async_trait::async_trait]
pub trait ResponseGenerator: Send + Sync {
    async fn generate(&self, thread: &Thread, prompt: &ThreadMessage) -> Result<GeneratedReply>;
}

/// Generates the reply, stores it, then settles its usage.
pub struct GenerationPipeline {
    threads: Arc<dyn ThreadStore>,
    generator: Arc<dyn ResponseGenerator>,
    usage: Arc<UsageHandler>,
    metrics: Arc<GateMetrics>,
}

impl GenerationPipeline {
    pub fn new(
        threads: Arc<dyn ThreadStore>,
        generator: Arc<dyn ResponseGenerator>,
        usage: Arc<UsageHandler>,
    ) -> Self {
        Self {
            threads,
            generator,
            usage,
            metrics: Arc::new(GateMetrics::new()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<GateMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Runs one task to completion, returning the stored reply id.
    pub async fn process(&self, task: &GenerationTask) -> Result<MessageId> {
        let prompt = self
            .threads
            .get_message(&task.prompt_message_id)
            .await?
            .ok_or_else(|| ThreadError::MessageNotFound {
                id: task.prompt_message_id.to_string(),
            })?;
        let thread = self
            .threads
            .get_thread(&task.thread_id)
            .await?
            .ok_or_else(|| Error::ThreadNotFound {
                thread_id: task.thread_id.to_string(),
            })?;

        let reply = self.generator.generate(&thread, &prompt).await?;

        let message = ThreadMessage::assistant(thread.id, prompt.user_id.clone(), reply.text)
            .with_usage(reply.usage)
            .with_model(reply.model.clone());
        let reply_id = self.threads.save_message(message).await?;

        self.usage
            .handle(UsageEvent {
                user_id: prompt.user_id,
                thread_id: Some(thread.id),
                agent_name: reply.agent_name,
                model: reply.model,
                provider: reply.provider,
                usage: reply.usage,
            })
            .await?;

        Ok(reply_id)
    }
}

#[async_trait::async_trait]
impl TaskHandler for GenerationPipeline {
    async fn run(&self, task: GenerationTask) {
        self.metrics.record_generation_start();
        match self.process(&task).await {
            Ok(reply_id) => {
                tracing::debug!(
                    thread_id = %task.thread_id,
                    reply_id = %reply_id,
                    "Generation completed"
                );
                self.metrics.record_generation_end(true);
            }
            Err(e) => {
                tracing::error!(
                    thread_id = %task.thread_id,
                    prompt_message_id = %task.prompt_message_id,
                    error = %e,
                    "Generation failed"
                );
                self.metrics.record_generation_end(false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LimitsConfig, TOKEN_USAGE_PER_USER};
    use crate::ratelimit::RateLimiter;
    use crate::thread::{MemoryThreadStore, MessageRole};
    use crate::usage::MemoryUsageLedger;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Echo;

    #[async_trait::async_trait]
    impl ResponseGenerator for Echo {
        async fn generate(&self, _thread: &Thread, prompt: &ThreadMessage) -> Result<GeneratedReply> {
            Ok(GeneratedReply {
                text: format!("echo: {}", prompt.text),
                usage: Usage::new(40, 60),
                model: "echo-1".into(),
                provider: "test".into(),
                agent_name: Some("echo".into()),
            })
        }
    }

    struct Broken;

    #[async_trait::async_trait]
    impl ResponseGenerator for Broken {
        async fn generate(&self, _thread: &Thread, _prompt: &ThreadMessage) -> Result<GeneratedReply> {
            Err(Error::Generation("model unavailable".into()))
        }
    }

    #[derive(Default)]
    struct Counting {
        runs: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl TaskHandler for Counting {
        async fn run(&self, _task: GenerationTask) {
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.runs.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn task() -> GenerationTask {
        GenerationTask {
            thread_id: ThreadId::new(),
            prompt_message_id: MessageId::new(),
        }
    }

    async fn pipeline(
        generator: Arc<dyn ResponseGenerator>,
    ) -> (GenerationPipeline, MemoryThreadStore, Arc<RateLimiter>, GenerationTask) {
        let threads = MemoryThreadStore::new();
        let thread = threads
            .create_thread(Thread::new(Some("alice".into())))
            .await
            .unwrap();
        let prompt_message_id = threads
            .save_message(ThreadMessage::user(thread.id, Some("alice".into()), "hello"))
            .await
            .unwrap();

        let limiter = Arc::new(RateLimiter::in_memory(LimitsConfig::default().entries()));
        let usage = Arc::new(UsageHandler::new(
            limiter.clone(),
            Arc::new(MemoryUsageLedger::new()),
        ));
        let pipeline = GenerationPipeline::new(Arc::new(threads.clone()), generator, usage);
        let task = GenerationTask {
            thread_id: thread.id,
            prompt_message_id,
        };
        (pipeline, threads, limiter, task)
    }

    #[tokio::test]
    async fn test_scheduler_runs_all_tasks_before_shutdown() {
        let handler = Arc::new(Counting::default());
        let scheduler = TokioScheduler::spawn(handler.clone());

        for _ in 0..5 {
            scheduler.schedule(task()).await.unwrap();
        }
        scheduler.shutdown().await;

        assert_eq!(handler.runs.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_schedule_after_shutdown_fails() {
        let scheduler = TokioScheduler::spawn(Arc::new(Counting::default()));
        scheduler.shutdown().await;

        let err = scheduler.schedule(task()).await.unwrap_err();
        assert!(matches!(err, Error::SchedulerClosed));
    }

    #[tokio::test]
    async fn test_pipeline_stores_reply_and_charges_usage() {
        let (pipeline, threads, limiter, task) = pipeline(Arc::new(Echo)).await;

        let reply_id = pipeline.process(&task).await.unwrap();
        let reply = threads.get_message(&reply_id).await.unwrap().unwrap();
        assert_eq!(reply.role, MessageRole::Assistant);
        assert_eq!(reply.text, "echo: hello");
        assert_eq!(reply.usage.unwrap().total(), 100);
        assert_eq!(reply.model.as_deref(), Some("echo-1"));

        let status = limiter
            .status(TOKEN_USAGE_PER_USER, Some("alice"))
            .await
            .unwrap();
        assert_eq!(status.value, 10_000.0 - 100.0);
    }

    #[tokio::test]
    async fn test_pipeline_failure_is_counted_not_propagated() {
        let (pipeline, threads, _limiter, task) = pipeline(Arc::new(Broken)).await;
        let metrics = Arc::new(GateMetrics::new());
        let pipeline = pipeline.with_metrics(metrics.clone());

        pipeline.run(task.clone()).await;

        assert_eq!(metrics.generation_failure.get(), 1);
        assert_eq!(metrics.generations_in_flight.get(), 0);
        assert_eq!(threads.message_count(&task.thread_id).await, 1);
    }

    #[tokio::test]
    async fn test_pipeline_missing_prompt() {
        let (pipeline, _threads, _limiter, mut task) = pipeline(Arc::new(Echo)).await;
        task.prompt_message_id = MessageId::new();

        let err = pipeline.process(&task).await.unwrap_err();
        assert!(matches!(err, Error::Thread(_)));
    }
}
