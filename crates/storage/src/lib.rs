pub mod error;
pub mod ids;
pub mod kv;
pub mod session_store;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use ids::{MessageId, SessionId};
pub use kv::{FileKeyValueStore, MemoryKeyValueStore};
pub use session_store::{MODEL_KEY, SESSIONS_KEY, SESSIONS_SCHEMA_VERSION, SessionStore};
pub use sqlite::SqliteKeyValueStore;
pub use types::{
    DEFAULT_MODEL, DEFAULT_SESSION_TITLE, Message, MessageRole, Session, TITLE_ELLIPSIS,
    TITLE_MAX_CHARS, derive_title, unix_timestamp_millis,
};

/// Minimal durable string storage the session store writes through.
///
/// A `write` must replace the previous value atomically: readers see either
/// the old value or the new one, never a mix.
pub trait KeyValueStore: Send + Sync {
    fn read(&self, key: &str) -> StorageResult<Option<String>>;
    fn write(&self, key: &str, value: &str) -> StorageResult<()>;
}
