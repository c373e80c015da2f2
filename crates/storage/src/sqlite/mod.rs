use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::time::Duration;

use snafu::ResultExt;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
use sqlx::{ConnectOptions, Connection, SqliteConnection};
use tokio::sync::{mpsc, oneshot};

use super::KeyValueStore;
use super::error::{
    CreateDirectorySnafu, InvariantViolationSnafu, SqliteConnectSnafu, SqliteMigrateSnafu,
    SqliteQuerySnafu, SqliteRuntimeInitSnafu, SqliteThreadSpawnSnafu, StorageError,
    StorageResult,
};
use super::types::unix_timestamp_millis;

type Reply<T> = std_mpsc::SyncSender<StorageResult<T>>;

#[derive(Debug)]
enum KvCommand {
    Read {
        key: String,
        reply: Reply<Option<String>>,
    },
    Write {
        key: String,
        value: String,
        reply: Reply<()>,
    },
}

/// Key-value persistence in a single embedded SQLite table.
///
/// One worker thread owns the only connection. Calls queue behind it and
/// block until their statement has run; the worker exits with the last handle.
#[derive(Debug, Clone)]
pub struct SqliteKeyValueStore {
    path: PathBuf,
    commands: mpsc::UnboundedSender<KvCommand>,
}

impl SqliteKeyValueStore {
    pub async fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context(CreateDirectorySnafu {
                stage: "sqlite-open-create-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let worker_path = path.clone();
        std::thread::Builder::new()
            .name("sqlite-kv".to_string())
            .spawn(move || serve_commands(worker_path, options, command_rx, ready_tx))
            .context(SqliteThreadSpawnSnafu {
                stage: "sqlite-open-spawn-worker",
            })?;

        ready_rx
            .await
            .map_err(|_| worker_gone("sqlite-open-ready"))??;
        tracing::debug!(path = ?path, "sqlite key-value store ready");

        Ok(Self { path, commands })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn call<T>(
        &self,
        stage: &'static str,
        command: impl FnOnce(Reply<T>) -> KvCommand,
    ) -> StorageResult<T> {
        let (reply_tx, reply_rx) = std_mpsc::sync_channel(1);
        self.commands
            .send(command(reply_tx))
            .map_err(|_| worker_gone(stage))?;
        reply_rx.recv().map_err(|_| worker_gone(stage))?
    }
}

impl KeyValueStore for SqliteKeyValueStore {
    fn read(&self, key: &str) -> StorageResult<Option<String>> {
        let key = key.to_string();
        self.call("kv-read", |reply| KvCommand::Read { key, reply })
    }

    fn write(&self, key: &str, value: &str) -> StorageResult<()> {
        let key = key.to_string();
        let value = value.to_string();
        self.call("kv-write", |reply| KvCommand::Write { key, value, reply })
    }
}

fn worker_gone(stage: &'static str) -> StorageError {
    InvariantViolationSnafu {
        stage,
        details: "sqlite worker thread has stopped".to_string(),
    }
    .build()
}

// Runs on the worker thread; the synchronous port never nests runtimes.
fn serve_commands(
    path: PathBuf,
    options: SqliteConnectOptions,
    mut commands: mpsc::UnboundedReceiver<KvCommand>,
    ready: oneshot::Sender<StorageResult<()>>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context(SqliteRuntimeInitSnafu {
            stage: "sqlite-kv-runtime-build",
        }) {
        Ok(runtime) => runtime,
        Err(error) => {
            let _ = ready.send(Err(error));
            return;
        }
    };

    runtime.block_on(async move {
        let mut connection = match open_connection(&path, &options).await {
            Ok(connection) => connection,
            Err(error) => {
                let _ = ready.send(Err(error));
                return;
            }
        };
        let _ = ready.send(Ok(()));

        while let Some(command) = commands.recv().await {
            match command {
                KvCommand::Read { key, reply } => {
                    let _ = reply.send(read_entry(&mut connection, &key).await);
                }
                KvCommand::Write { key, value, reply } => {
                    let _ = reply.send(write_entry(&mut connection, &key, &value).await);
                }
            }
        }

        if let Err(error) = connection.close().await {
            tracing::debug!(path = ?path, error = %error, "sqlite connection closed uncleanly");
        }
    });
}

async fn open_connection(
    path: &Path,
    options: &SqliteConnectOptions,
) -> StorageResult<SqliteConnection> {
    let mut connection = options.connect().await.context(SqliteConnectSnafu {
        stage: "sqlite-open-connect",
        path: path.to_path_buf(),
    })?;

    sqlx::migrate!("./migrations")
        .run(&mut connection)
        .await
        .context(SqliteMigrateSnafu {
            stage: "sqlite-open-migrate",
        })?;

    Ok(connection)
}

async fn read_entry(connection: &mut SqliteConnection, key: &str) -> StorageResult<Option<String>> {
    sqlx::query_scalar::<_, String>("SELECT value FROM kv_entries WHERE key = ?")
        .bind(key)
        .fetch_optional(&mut *connection)
        .await
        .context(SqliteQuerySnafu {
            stage: "kv-read-query",
        })
}

async fn write_entry(connection: &mut SqliteConnection, key: &str, value: &str) -> StorageResult<()> {
    let now = i64::try_from(unix_timestamp_millis()).unwrap_or(i64::MAX);
    sqlx::query(
        "INSERT INTO kv_entries (key, value, updated_at) VALUES (?, ?, ?) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
    )
    .bind(key)
    .bind(value)
    .bind(now)
    .execute(&mut *connection)
    .await
    .context(SqliteQuerySnafu {
        stage: "kv-write-upsert",
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn values_survive_reopening_the_database() {
        let directory = tempfile::tempdir().unwrap();
        let location = directory.path().join("state").join("cortex.db");

        let store = SqliteKeyValueStore::open(&location).await.unwrap();
        assert_eq!(store.read("chat_sessions").unwrap(), None);
        store.write("chat_sessions", "[]").unwrap();
        store.write("chat_sessions", "[1]").unwrap();
        drop(store);

        let reopened = SqliteKeyValueStore::open(&location).await.unwrap();
        assert_eq!(reopened.path(), location.as_path());
        assert_eq!(
            reopened.read("chat_sessions").unwrap().as_deref(),
            Some("[1]")
        );
    }

    #[tokio::test]
    async fn cloned_handles_share_one_connection() {
        let directory = tempfile::tempdir().unwrap();
        let store = SqliteKeyValueStore::open(directory.path().join("kv.db"))
            .await
            .unwrap();
        let clone = store.clone();

        store.write("current_model", "mistral").unwrap();
        drop(store);

        assert_eq!(
            clone.read("current_model").unwrap().as_deref(),
            Some("mistral")
        );
        assert_eq!(clone.read("missing").unwrap(), None);
    }

    #[tokio::test]
    async fn unopenable_location_is_reported() {
        let directory = tempfile::tempdir().unwrap();
        let blocker = directory.path().join("not-a-directory");
        std::fs::write(&blocker, "file").unwrap();

        let error = SqliteKeyValueStore::open(blocker.join("kv.db"))
            .await
            .unwrap_err();
        assert!(matches!(error, StorageError::CreateDirectory { .. }));
    }
}
