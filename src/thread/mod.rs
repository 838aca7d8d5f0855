//! Conversation threads: message persistence and recent-context fetch.

mod ids;
mod message;
mod store;

pub use ids::{MessageId, ThreadId};
pub use message::{ContextQuery, MessageRole, Thread, ThreadMessage};
pub use store::{MemoryThreadStore, ThreadStore, authorize_thread_access};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ThreadError {
    #[error("Thread not found: {id}")]
    NotFound { id: String },

    #[error("Access to thread {id} denied")]
    AccessDenied { id: String },

    #[error("Message not found: {id}")]
    MessageNotFound { id: String },

    #[error("Storage error: {message}")]
    Storage { message: String },
}

pub type ThreadResult<T> = std::result::Result<T, ThreadError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_error_display() {
        let err = ThreadError::NotFound {
            id: "t-123".to_string(),
        };
        assert!(err.to_string().contains("t-123"));
    }
}
