use std::sync::Arc;

use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, ensure};

use super::KeyValueStore;
use super::error::{
    DeserializeSnafu, NotFoundSnafu, SerializeSnafu, StorageResult, UnsupportedVersionSnafu,
};
use super::ids::SessionId;
use super::types::{DEFAULT_MODEL, Message, Session, derive_title};

pub const SESSIONS_KEY: &str = "chat_sessions";
pub const MODEL_KEY: &str = "current_model";
pub const SESSIONS_SCHEMA_VERSION: u32 = 1;

#[derive(Serialize)]
struct SessionsEnvelope<'a> {
    version: u32,
    sessions: &'a [Session],
}

// Bare arrays predate the envelope and are read as version 0.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredSessions {
    Legacy(Vec<Session>),
    Versioned {
        version: u32,
        sessions: serde_json::Value,
    },
}

/// Ordered conversations plus the active-conversation pointer.
///
/// Every mutation lands in memory first and is then written through the
/// [`KeyValueStore`]. A failed write is logged and never undoes the mutation.
pub struct SessionStore {
    backend: Arc<dyn KeyValueStore>,
    sessions: Vec<Session>,
    current_session_id: Option<SessionId>,
    default_model: String,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn KeyValueStore>, default_model: impl Into<String>) -> Self {
        let default_model = default_model.into();
        let default_model = if default_model.trim().is_empty() {
            DEFAULT_MODEL.to_string()
        } else {
            default_model.trim().to_string()
        };

        Self {
            backend,
            sessions: Vec::new(),
            current_session_id: None,
            default_model,
        }
    }

    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    pub fn session(&self, session_id: SessionId) -> Option<&Session> {
        self.sessions
            .iter()
            .find(|session| session.id == session_id)
    }

    pub fn current_session_id(&self) -> Option<SessionId> {
        self.current_session_id
    }

    pub fn current_session(&self) -> Option<&Session> {
        self.current_session_id
            .and_then(|session_id| self.session(session_id))
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    pub fn create_session(&mut self, model: impl Into<String>) -> Session {
        let session = Session::new(model);
        self.sessions.push(session.clone());
        self.current_session_id = Some(session.id);
        self.persist();
        session
    }

    pub fn delete_session(&mut self, session_id: SessionId) {
        let before = self.sessions.len();
        self.sessions.retain(|session| session.id != session_id);
        if self.sessions.len() == before {
            return;
        }

        if self.current_session_id == Some(session_id) {
            self.current_session_id = self.sessions.first().map(|session| session.id);
        }
        self.persist();
    }

    pub fn append_message(&mut self, session_id: SessionId, message: Message) -> StorageResult<()> {
        let session = self.session_mut(session_id, "session-store-append-message")?;
        if session.messages.is_empty() {
            session.title = derive_title(&message.content);
        }
        session.messages.push(message);
        session.touch();

        self.persist();
        Ok(())
    }

    pub fn set_session_model(
        &mut self,
        session_id: SessionId,
        model: impl Into<String>,
    ) -> StorageResult<()> {
        let session = self.session_mut(session_id, "session-store-set-model")?;
        session.model = model.into();
        session.touch();

        self.persist();
        Ok(())
    }

    /// Points the store at `session_id` without checking it exists; callers
    /// only ever hold ids handed out by [`SessionStore::create_session`].
    pub fn set_current_session(&mut self, session_id: Option<SessionId>) {
        self.current_session_id = session_id;
    }

    pub fn set_default_model(&mut self, model: &str) {
        let model = model.trim();
        if model.is_empty() {
            return;
        }

        self.default_model = model.to_string();
        if let Err(error) = self.backend.write(MODEL_KEY, model) {
            tracing::warn!(key = MODEL_KEY, error = %error, "failed to persist default model");
        }
    }

    /// Replaces the in-memory collection with what the backend holds.
    ///
    /// Missing or unreadable data leaves an empty collection behind.
    pub fn load(&mut self) {
        match self.read_sessions() {
            Ok(sessions) => self.sessions = sessions,
            Err(error) => {
                tracing::warn!(
                    key = SESSIONS_KEY,
                    error = %error,
                    "stored sessions are unreadable, starting empty"
                );
                self.sessions.clear();
            }
        }

        match self.backend.read(MODEL_KEY) {
            Ok(Some(model)) if !model.trim().is_empty() => {
                self.default_model = model.trim().to_string();
            }
            Ok(_) => {}
            Err(error) => {
                tracing::warn!(key = MODEL_KEY, error = %error, "failed to read default model");
            }
        }

        let current_is_valid = self
            .current_session_id
            .is_some_and(|session_id| self.session(session_id).is_some());
        if !current_is_valid {
            self.current_session_id = self.sessions.first().map(|session| session.id);
        }

        tracing::debug!(
            sessions = self.sessions.len(),
            default_model = %self.default_model,
            "loaded session store"
        );
    }

    pub fn persist(&self) {
        if let Err(error) = self.write_sessions() {
            tracing::warn!(
                key = SESSIONS_KEY,
                sessions = self.sessions.len(),
                error = %error,
                "failed to persist sessions"
            );
        }
    }

    fn session_mut(
        &mut self,
        session_id: SessionId,
        stage: &'static str,
    ) -> StorageResult<&mut Session> {
        self.sessions
            .iter_mut()
            .find(|session| session.id == session_id)
            .context(NotFoundSnafu {
                stage,
                entity: "session",
                id: session_id.to_string(),
            })
    }

    fn write_sessions(&self) -> StorageResult<()> {
        let envelope = SessionsEnvelope {
            version: SESSIONS_SCHEMA_VERSION,
            sessions: &self.sessions,
        };
        let payload = serde_json::to_string(&envelope).context(SerializeSnafu {
            stage: "session-store-persist-serialize",
            key: SESSIONS_KEY,
        })?;
        self.backend.write(SESSIONS_KEY, &payload)
    }

    fn read_sessions(&self) -> StorageResult<Vec<Session>> {
        let Some(raw) = self.backend.read(SESSIONS_KEY)? else {
            return Ok(Vec::new());
        };
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }

        let stored: StoredSessions = serde_json::from_str(&raw).context(DeserializeSnafu {
            stage: "session-store-load-parse",
            key: SESSIONS_KEY,
        })?;

        match stored {
            StoredSessions::Legacy(sessions) => Ok(sessions),
            StoredSessions::Versioned { version, sessions } => {
                ensure!(
                    version <= SESSIONS_SCHEMA_VERSION,
                    UnsupportedVersionSnafu {
                        stage: "session-store-load-version",
                        key: SESSIONS_KEY,
                        found: version,
                        supported: SESSIONS_SCHEMA_VERSION,
                    }
                );
                serde_json::from_value(sessions).context(DeserializeSnafu {
                    stage: "session-store-load-sessions",
                    key: SESSIONS_KEY,
                })
            }
        }
    }
}
