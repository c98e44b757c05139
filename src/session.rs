//! In-memory conversation sessions (non-persistent).

use crate::agent::{Event, history_from_events};
use crate::error::{Error, Result};
use crate::llm::ConversationMessage;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub app_name: String,
    pub user_id: String,
    pub state: Map<String, Value>,
    pub events: Vec<Event>,
    /// Seconds since the Unix epoch.
    pub last_update_time: f64,
}

impl Session {
    /// The conversation so far, rebuilt from stored events.
    pub fn history(&self) -> Vec<ConversationMessage> {
        history_from_events(&self.events)
    }
}

type Key = (String, String, String);

fn key(app_name: &str, user_id: &str, session_id: &str) -> Key {
    (app_name.into(), user_id.into(), session_id.into())
}

fn now_secs() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

#[derive(Clone, Default)]
pub struct SessionStore {
    sessions: Arc<RwLock<HashMap<Key, Session>>>,
    turns: Arc<Mutex<HashMap<Key, Arc<Mutex<()>>>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session, generating an id unless one is given.
    pub async fn create(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: Option<&str>,
        state: Option<Map<String, Value>>,
    ) -> Result<Session> {
        let id = match session_id.map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => Uuid::new_v4().to_string(),
        };
        let session = Session {
            id: id.clone(),
            app_name: app_name.into(),
            user_id: user_id.into(),
            state: state.unwrap_or_default(),
            events: Vec::new(),
            last_update_time: now_secs(),
        };

        let mut sessions = self.sessions.write().await;
        let k = key(app_name, user_id, &id);
        if sessions.contains_key(&k) {
            return Err(Error::Conflict(format!("session {id}")));
        }
        sessions.insert(k, session.clone());
        Ok(session)
    }

    pub async fn get(&self, app_name: &str, user_id: &str, session_id: &str) -> Option<Session> {
        self.sessions
            .read()
            .await
            .get(&key(app_name, user_id, session_id))
            .cloned()
    }

    /// Sessions of one user, most recently updated first.
    pub async fn list(&self, app_name: &str, user_id: &str) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.app_name == app_name && s.user_id == user_id)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.last_update_time.total_cmp(&a.last_update_time));
        sessions
    }

    /// Hold this while a turn runs on the session; a second turn on the same
    /// session waits until the guard is dropped.
    pub async fn lock_turn(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: &str,
    ) -> OwnedMutexGuard<()> {
        let lock = self
            .turns
            .lock()
            .await
            .entry(key(app_name, user_id, session_id))
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    pub async fn delete(&self, app_name: &str, user_id: &str, session_id: &str) -> Result<()> {
        self.turns
            .lock()
            .await
            .remove(&key(app_name, user_id, session_id));
        self.sessions
            .write()
            .await
            .remove(&key(app_name, user_id, session_id))
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))
    }

    /// Record a finished turn: its events, and the session state as the turn left it.
    pub async fn append_events(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: &str,
        events: Vec<Event>,
        state: Option<Map<String, Value>>,
    ) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&key(app_name, user_id, session_id))
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;
        session.events.extend(events);
        if let Some(state) = state {
            session.state = state;
        }
        session.last_update_time = now_secs();
        Ok(())
    }
}
