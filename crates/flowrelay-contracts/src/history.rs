use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

pub const HISTORY_CAPACITY: usize = 10;
pub const CONTEXT_WINDOW: usize = 5;

const CONTEXT_HEADER: &str = "Previous conversation context:";
const NO_TEXT_PLACEHOLDER: &str = "[Audio command]";

#[derive(Debug, Clone, PartialEq)]
pub struct ConversationExchange {
    pub user_text: Option<String>,
    pub ai_text: String,
    pub timestamp: DateTime<Utc>,
}

/// Bounded, oldest-first log of prior exchanges.
#[derive(Debug, Clone, Default)]
pub struct ConversationHistory {
    exchanges: VecDeque<ConversationExchange>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, user_text: Option<String>, ai_text: impl Into<String>) {
        self.exchanges.push_back(ConversationExchange {
            user_text,
            ai_text: ai_text.into(),
            timestamp: Utc::now(),
        });
        while self.exchanges.len() > HISTORY_CAPACITY {
            self.exchanges.pop_front();
        }
    }

    pub fn render_context(&self) -> String {
        if self.exchanges.is_empty() {
            return String::new();
        }
        let skip = self.exchanges.len().saturating_sub(CONTEXT_WINDOW);
        let mut lines = vec![CONTEXT_HEADER.to_string()];
        for exchange in self.exchanges.iter().skip(skip) {
            let user = exchange.user_text.as_deref().unwrap_or(NO_TEXT_PLACEHOLDER);
            lines.push(format!("User: {user}"));
            lines.push(format!("AI: {}", exchange.ai_text));
        }
        lines.join("\n") + "\n\n"
    }

    pub fn clear(&mut self) {
        self.exchanges.clear();
    }

    pub fn len(&self) -> usize {
        self.exchanges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }

    pub fn exchanges(&self) -> impl Iterator<Item = &ConversationExchange> {
        self.exchanges.iter()
    }
}

/// Process-wide history shared by every request worker. Each operation holds
/// the lock for its full duration.
#[derive(Debug, Default)]
pub struct ContextManager {
    history: Mutex<ConversationHistory>,
}

impl ContextManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, user_text: Option<String>, ai_text: impl Into<String>) {
        self.lock().append(user_text, ai_text);
    }

    pub fn render_context(&self) -> String {
        self.lock().render_context()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn snapshot(&self) -> ConversationHistory {
        self.lock().clone()
    }

    // A worker that panicked mid-append leaves the deque itself intact.
    fn lock(&self) -> MutexGuard<'_, ConversationHistory> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
