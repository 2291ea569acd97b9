//! # Conversation Context
//!
//! Per-call key/value notes that outlive a single AI response: the agent's
//! last answer, caller-specific context injected into the system prompt, and
//! anything else a session wants to remember until the call ends.
//!
//! ## Contract:
//! - `instructions_for(stream_id)`: base prompt plus the session's `context` entry
//! - `record(stream_id, key, text)`: store or overwrite one entry
//! - `clear(stream_id)`: forget everything about a call (on teardown)

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Key under which the agent's most recent complete response is stored.
pub const LAST_AI_RESPONSE: &str = "last_ai_response";

/// Key whose value is appended to the base instructions.
pub const CONTEXT_KEY: &str = "context";

/// Storage for per-call conversation notes.
///
/// ## Rust Concepts:
/// - **Send + Sync**: Shared by every session task through an `Arc<dyn ContextStore>`
/// - **&self methods**: Implementations use interior mutability
pub trait ContextStore: Send + Sync {
    /// System instructions for the session's configuration update.
    fn instructions_for(&self, stream_id: &str) -> String;

    fn record(&self, stream_id: &str, key: &str, text: &str);

    fn get(&self, stream_id: &str, key: &str) -> Option<String>;

    fn clear(&self, stream_id: &str);
}

/// Process-local context store.
pub struct InMemoryContextStore {
    base_instructions: String,
    entries: RwLock<HashMap<String, HashMap<String, String>>>,
}

impl InMemoryContextStore {
    pub fn new(base_instructions: impl Into<String>) -> Self {
        Self {
            base_instructions: base_instructions.into(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Number of calls with at least one stored entry.
    #[cfg(test)]
    pub fn session_count(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl ContextStore for InMemoryContextStore {
    fn instructions_for(&self, stream_id: &str) -> String {
        let extra = self.get(stream_id, CONTEXT_KEY).unwrap_or_default();
        format!("{}\n{}", self.base_instructions, extra).trim().to_string()
    }

    fn record(&self, stream_id: &str, key: &str, text: &str) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries
            .entry(stream_id.to_string())
            .or_default()
            .insert(key.to_string(), text.to_string());
    }

    fn get(&self, stream_id: &str, key: &str) -> Option<String> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(stream_id).and_then(|session| session.get(key)).cloned()
    }

    fn clear(&self, stream_id: &str) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(stream_id);
    }
}
