//! Per-session state keyed by session id.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use parking_lot::{Mutex, RwLock};

use crate::core::session::SessionReplState;
use crate::runtime::Interpreter;

/// Protocol state and interpreter of one session, always locked together.
pub struct SessionSlot {
    pub state: SessionReplState,
    pub interpreter: Interpreter,
}

impl SessionSlot {
    pub fn new(mut state: SessionReplState, interpreter: Interpreter) -> Self {
        state.namespace = interpreter.snapshot();
        Self { state, interpreter }
    }
}

/// Session map. Each entry has its own lock, so calls on one session are
/// serialized while different sessions proceed in parallel.
#[derive(Default)]
pub struct StateStore {
    sessions: RwLock<HashMap<String, Arc<Mutex<SessionSlot>>>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, slot: SessionSlot) -> Result<()> {
        let mut sessions = self.sessions.write();
        let session_id = slot.state.session_id.clone();
        if sessions.contains_key(&session_id) {
            return Err(anyhow!("session '{session_id}' already exists"));
        }
        sessions.insert(session_id, Arc::new(Mutex::new(slot)));
        Ok(())
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Mutex<SessionSlot>>> {
        self.sessions.read().get(session_id).cloned()
    }

    pub fn remove(&self, session_id: &str) -> Option<Arc<Mutex<SessionSlot>>> {
        self.sessions.write().remove(session_id)
    }

    /// Sorted ids of open sessions.
    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}
