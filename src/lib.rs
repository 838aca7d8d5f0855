//! # chat-gate
//!
//! Pre-flight usage estimation and a dual-layer rate gate for chat agent
//! backends.
//!
//! A question is admitted only if the user may still send messages (per user
//! and globally) and is not in token debt (per user and globally), judged on
//! an estimate of what answering it will cost. Generation runs asynchronously;
//! once it finishes, the real usage is charged against the token quotas and
//! recorded for billing.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use chat_gate::prelude::*;
//!
//! struct Replies;
//!
//! #[async_trait::async_trait]
//! impl ResponseGenerator for Replies {
//!     async fn generate(&self, _thread: &Thread, prompt: &ThreadMessage) -> Result<GeneratedReply> {
//!         Ok(GeneratedReply {
//!             text: format!("You said: {}", prompt.text),
//!             usage: Usage::new(12, 30),
//!             model: "demo".into(),
//!             provider: "local".into(),
//!             agent_name: None,
//!         })
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let limits = LimitsConfig::default().from_env()?;
//!     limits.validate()?;
//!     let limiter = Arc::new(RateLimiter::in_memory(limits.entries()));
//!     let threads = Arc::new(MemoryThreadStore::new());
//!
//!     let usage = Arc::new(UsageHandler::new(limiter.clone(), Arc::new(MemoryUsageLedger::new())));
//!     let pipeline = GenerationPipeline::new(threads.clone(), Arc::new(Replies), usage);
//!     let scheduler = Arc::new(TokioScheduler::spawn(Arc::new(pipeline)));
//!
//!     let gate = ChatGate::new(limiter, threads.clone(), scheduler.clone());
//!     let thread = threads.create_thread(Thread::new(Some("alice".into()))).await?;
//!
//!     match gate.submit_question(Some("alice"), &thread.id, "Hello!").await {
//!         Ok(admission) => println!("queued {}", admission.message_id),
//!         Err(e) if e.is_rate_limited() => println!("slow down: {:?}", e.retry_after()),
//!         Err(e) => return Err(e),
//!     }
//!
//!     scheduler.shutdown().await;
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod gate;
pub mod metrics;
pub mod prelude;
pub mod ratelimit;
pub mod scheduler;
pub mod thread;
pub mod usage;

pub use config::{ConfigError, LimitsConfig};
pub use gate::{Admission, ChatGate};
pub use metrics::{GateMetrics, MetricsSummary};
#[cfg(feature = "redis-backend")]
pub use ratelimit::{RedisConfig, RedisRateLimitStore};
pub use ratelimit::{
    Clock, LimitArgs, LimitPolicy, LimitStatus, ManualClock, MemoryRateLimitStore, PolicyKind,
    RateLimitError, RateLimitSnapshot, RateLimitStore, RateLimiter, SystemClock,
};
pub use scheduler::{
    GeneratedReply, GenerationPipeline, GenerationTask, ResponseGenerator, Scheduler, TaskHandler,
    TokioScheduler,
};
pub use thread::{
    ContextQuery, MemoryThreadStore, MessageId, MessageRole, Thread, ThreadError, ThreadId,
    ThreadMessage, ThreadStore,
};
pub use usage::{
    HeuristicEstimator, MemoryUsageLedger, TokenEstimator, Usage, UsageEstimator, UsageEvent,
    UsageHandler, UsageLedger, UsageRecord,
};

/// Error type for chat-gate operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// No authenticated user.
    #[error("Unauthorized")]
    Unauthorized,

    /// The user may not post to this thread.
    #[error("Access to thread {thread_id} denied")]
    Forbidden { thread_id: String },

    #[error("Thread not found: {thread_id}")]
    ThreadNotFound { thread_id: String },

    /// A quota refused the request.
    #[error("Rate limit {limit} exceeded{}", match retry_after {
        Some(d) => format!(", retry in {:.1}s", d.as_secs_f64()),
        None => String::new(),
    })]
    RateLimited {
        limit: String,
        retry_after: Option<std::time::Duration>,
    },

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Quota or ledger storage failed.
    #[error("Store error: {0}")]
    Store(String),

    /// Thread storage failed.
    #[error("Thread error: {0}")]
    Thread(String),

    /// Reply generation failed.
    #[error("Generation failed: {0}")]
    Generation(String),

    /// The task queue no longer accepts work.
    #[error("Scheduler is shut down")]
    SchedulerClosed,

    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error category for unified error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Missing identity or thread access
    Authorization,
    /// Quota refusals; may succeed after `retry_after`
    RateLimit,
    /// Configuration errors
    Configuration,
    /// Storage, scheduler, or generation failures
    Infrastructure,
    /// Internal errors (IO, JSON)
    Internal,
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Unauthorized | Error::Forbidden { .. } | Error::ThreadNotFound { .. } => {
                ErrorCategory::Authorization
            }
            Error::RateLimited { .. } => ErrorCategory::RateLimit,
            Error::Config(_) => ErrorCategory::Configuration,
            Error::Store(_) | Error::Thread(_) | Error::Generation(_) | Error::SchedulerClosed => {
                ErrorCategory::Infrastructure
            }
            Error::Json(_) | Error::Io(_) => ErrorCategory::Internal,
        }
    }

    pub fn is_authorization_error(&self) -> bool {
        self.category() == ErrorCategory::Authorization
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Error::Unauthorized)
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Error::RateLimited { .. })
    }

    /// Name of the quota that refused the request.
    pub fn limit_name(&self) -> Option<&str> {
        match self {
            Error::RateLimited { limit, .. } => Some(limit),
            _ => None,
        }
    }

    pub fn retry_after(&self) -> Option<std::time::Duration> {
        match self {
            Error::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        match err {
            config::ConfigError::InvalidValue { key, message } => {
                Error::Config(format!("Invalid value for {}: {}", key, message))
            }
            config::ConfigError::Serialization(e) => Error::Json(e),
            config::ConfigError::Io(e) => Error::Io(e),
        }
    }
}

impl From<ratelimit::RateLimitError> for Error {
    fn from(err: ratelimit::RateLimitError) -> Self {
        match err {
            ratelimit::RateLimitError::UnknownLimit { name } => {
                Error::Config(format!("Unknown rate limit: {}", name))
            }
            ratelimit::RateLimitError::Storage { message } => Error::Store(message),
        }
    }
}

impl From<thread::ThreadError> for Error {
    fn from(err: thread::ThreadError) -> Self {
        match err {
            thread::ThreadError::NotFound { id } => Error::ThreadNotFound { thread_id: id },
            thread::ThreadError::AccessDenied { id } => Error::Forbidden { thread_id: id },
            _ => Error::Thread(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
