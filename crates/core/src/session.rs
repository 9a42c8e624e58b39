//! Per-conversation memory, process-lifetime only.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::models::{ChatMessage, ChatRole};

/// Turns of history retained per session; two messages per turn.
pub const MAX_HISTORY_TURNS: usize = 10;

/// Capability: create, read and append bounded conversation histories.
///
/// `append` must be atomic per session id; concurrent appenders may not
/// interleave within one message or lose messages.
pub trait SessionStore: Send + Sync {
    fn create(&self) -> String;

    /// Returns a copy of the retained history; empty for unknown ids.
    fn get(&self, session_id: &str) -> Vec<ChatMessage>;

    fn append(&self, session_id: &str, role: ChatRole, content: String);

    /// Number of sessions currently held.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Map guarded by one lock; held only for the single map operation, so
/// traffic on different ids contends only momentarily.
#[derive(Clone, Default)]
pub struct InMemorySessionStore {
    sessions: Arc<Mutex<HashMap<String, Vec<ChatMessage>>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for InMemorySessionStore {
    fn create(&self) -> String {
        let session_id = Uuid::new_v4().simple().to_string()[..12].to_string();
        let mut sessions = self.sessions.lock().expect("session store lock poisoned");
        sessions.insert(session_id.clone(), Vec::new());
        session_id
    }

    fn get(&self, session_id: &str) -> Vec<ChatMessage> {
        let sessions = self.sessions.lock().expect("session store lock poisoned");
        sessions.get(session_id).cloned().unwrap_or_default()
    }

    fn append(&self, session_id: &str, role: ChatRole, content: String) {
        let mut sessions = self.sessions.lock().expect("session store lock poisoned");
        let history = sessions.entry(session_id.to_string()).or_default();
        history.push(ChatMessage { role, content });

        let cap = MAX_HISTORY_TURNS * 2;
        if history.len() > cap {
            let overflow = history.len() - cap;
            history.drain(..overflow);
        }
    }

    fn len(&self) -> usize {
        let sessions = self.sessions.lock().expect("session store lock poisoned");
        sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn created_sessions_start_empty_with_unique_ids() {
        let store = InMemorySessionStore::new();
        let first = store.create();
        let second = store.create();
        assert_ne!(first, second);
        assert_eq!(first.len(), 12);
        assert!(store.get(&first).is_empty());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn append_preserves_order() {
        let store = InMemorySessionStore::new();
        let id = store.create();
        store.append(&id, ChatRole::User, "What phones do you have?".to_string());
        store.append(&id, ChatRole::Assistant, "We carry Phone X.".to_string());

        let history = store.get(&id);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, ChatRole::User);
        assert_eq!(history[1].role, ChatRole::Assistant);
    }

    #[test]
    fn history_trims_oldest_first() {
        let store = InMemorySessionStore::new();
        let id = store.create();
        for turn in 0..(MAX_HISTORY_TURNS + 3) {
            store.append(&id, ChatRole::User, format!("question {turn}"));
            store.append(&id, ChatRole::Assistant, format!("answer {turn}"));
        }

        let history = store.get(&id);
        assert_eq!(history.len(), MAX_HISTORY_TURNS * 2);
        assert_eq!(history[0].content, "question 3");
        assert_eq!(history.last().unwrap().content, format!("answer {}", MAX_HISTORY_TURNS + 2));
    }

    #[test]
    fn concurrent_appends_lose_nothing() {
        let store = InMemorySessionStore::new();
        let id = store.create();
        let appenders = 8;
        let per_thread = 2;

        let handles: Vec<_> = (0..appenders)
            .map(|worker| {
                let store = store.clone();
                let id = id.clone();
                thread::spawn(move || {
                    for round in 0..per_thread {
                        store.append(&id, ChatRole::User, format!("w{worker} r{round}"));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let history = store.get(&id);
        assert_eq!(history.len(), appenders * per_thread);
    }

    #[test]
    fn unknown_session_reads_empty() {
        let store = InMemorySessionStore::new();
        assert!(store.get("missing").is_empty());
    }
}
