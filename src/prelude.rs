//! Prelude module for convenient imports.
//!
//! ```rust
//! use chat_gate::prelude::*;
//! ```

// Core types
pub use crate::Error;
pub use crate::Result;

// Admission
pub use crate::gate::{Admission, ChatGate};

// Configuration
pub use crate::config::LimitsConfig;

// Quotas
pub use crate::ratelimit::{LimitArgs, LimitPolicy, RateLimitStore, RateLimiter};

// Threads
pub use crate::thread::{MemoryThreadStore, Thread, ThreadId, ThreadMessage, ThreadStore};

// Usage
pub use crate::usage::{MemoryUsageLedger, TokenEstimator, Usage, UsageHandler};

// Generation
pub use crate::scheduler::{
    GeneratedReply, GenerationPipeline, ResponseGenerator, Scheduler, TokioScheduler,
};
