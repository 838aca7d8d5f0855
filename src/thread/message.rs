use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{MessageId, ThreadId};
use crate::usage::Usage;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Thread {
    pub id: ThreadId,
    /// Owner; ownerless threads are open to every authenticated user.
    pub user_id: Option<String>,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Thread {
    pub fn new(user_id: Option<String>) -> Self {
        Self {
            id: ThreadId::new(),
            user_id,
            title: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn is_accessible_by(&self, user_id: &str) -> bool {
        self.user_id.as_deref().is_none_or(|owner| owner == user_id)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ThreadMessage {
    pub id: MessageId,
    pub thread_id: ThreadId,
    pub user_id: Option<String>,
    pub role: MessageRole,
    pub text: String,
    /// Recorded once the generation that produced this message finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ThreadMessage {
    pub fn user(thread_id: ThreadId, user_id: Option<String>, text: impl Into<String>) -> Self {
        Self::new(thread_id, user_id, MessageRole::User, text)
    }

    pub fn assistant(
        thread_id: ThreadId,
        user_id: Option<String>,
        text: impl Into<String>,
    ) -> Self {
        Self::new(thread_id, user_id, MessageRole::Assistant, text)
    }

    fn new(
        thread_id: ThreadId,
        user_id: Option<String>,
        role: MessageRole,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: MessageId::new(),
            thread_id,
            user_id,
            role,
            text: text.into(),
            usage: None,
            model: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// Which recent messages to fetch as context.
#[derive(Clone, Debug, Default)]
pub struct ContextQuery {
    pub thread_id: Option<ThreadId>,
    /// Restrict to messages of this user when set.
    pub user_id: Option<String>,
    pub recent_messages: usize,
}

impl ContextQuery {
    pub fn recent(thread_id: Option<ThreadId>, recent_messages: usize) -> Self {
        Self {
            thread_id,
            user_id: None,
            recent_messages,
        }
    }

    pub fn for_user(mut self, user_id: Option<&str>) -> Self {
        self.user_id = user_id.map(str::to_string);
        self
    }
}
