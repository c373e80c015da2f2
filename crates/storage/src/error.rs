use std::path::PathBuf;

use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    #[snafu(display("storage entity '{entity}' with id '{id}' was not found"))]
    NotFound {
        stage: &'static str,
        entity: &'static str,
        id: String,
    },
    #[snafu(display("storage id '{raw}' is invalid for {id_type}"))]
    InvalidId {
        stage: &'static str,
        id_type: &'static str,
        raw: String,
        source: uuid::Error,
    },
    #[snafu(display("storage key '{key}' is not a valid key name"))]
    InvalidKey { stage: &'static str, key: String },
    #[snafu(display("failed to create storage directory at {path:?}"))]
    CreateDirectory {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to read storage key '{key}' from {path:?}"))]
    ReadKey {
        stage: &'static str,
        key: String,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to write storage key '{key}' to {path:?}"))]
    WriteKey {
        stage: &'static str,
        key: String,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to replace storage file from {from:?} to {to:?}"))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize '{key}' on `{stage}`: {source}"))]
    Serialize {
        stage: &'static str,
        key: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("stored '{key}' is unreadable on `{stage}`: {source}"))]
    Deserialize {
        stage: &'static str,
        key: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("stored '{key}' has schema version {found}, newest supported is {supported}"))]
    UnsupportedVersion {
        stage: &'static str,
        key: &'static str,
        found: u32,
        supported: u32,
    },
    #[snafu(display("failed to open sqlite database at {path:?}"))]
    SqliteConnect {
        stage: &'static str,
        path: PathBuf,
        source: sqlx::Error,
    },
    #[snafu(display("failed to run sqlite migrations"))]
    SqliteMigrate {
        stage: &'static str,
        source: sqlx::migrate::MigrateError,
    },
    #[snafu(display("sqlite query failed at {stage}: {source}"))]
    SqliteQuery {
        stage: &'static str,
        source: sqlx::Error,
    },
    #[snafu(display("failed to spawn sqlite worker thread"))]
    SqliteThreadSpawn {
        stage: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("failed to initialize sqlite worker runtime"))]
    SqliteRuntimeInit {
        stage: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("storage invariant violation: {details}"))]
    InvariantViolation {
        stage: &'static str,
        details: String,
    },
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
