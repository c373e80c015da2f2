use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use cortex_llm::{
    GenerateBackend, GenerateRequest, GenerateStreamHandle, Model, OllamaClient, ProviderError,
    StreamEvent,
};
use cortex_storage::{
    FileKeyValueStore, KeyValueStore, Message, Session, SessionId, SessionStore,
    SqliteKeyValueStore, StorageError,
};
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;

use super::exchange::{ExchangeId, ExchangeState, ExchangeTransition, ExchangeTransitionResult};
use super::monitor::{ConnectionMonitor, ConnectionStatus};
use super::settings::{AppSettings, StorageBackend};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChatError {
    #[snafu(display("another reply is still streaming"))]
    Busy { stage: &'static str },
    #[snafu(display("backend is {status}, cannot send"))]
    NotConnected {
        stage: &'static str,
        status: ConnectionStatus,
    },
    #[snafu(display("no conversation is selected"))]
    NoCurrentSession { stage: &'static str },
    #[snafu(display("message is empty"))]
    EmptyPrompt { stage: &'static str },
    #[snafu(display("conversation {session_id} does not exist"))]
    SessionNotFound {
        stage: &'static str,
        session_id: SessionId,
    },
    #[snafu(display("{source}"))]
    Backend {
        stage: &'static str,
        source: ProviderError,
    },
    #[snafu(display("storage failed on `{stage}`: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("backend stream closed without a final record"))]
    StreamClosed { stage: &'static str },
    #[snafu(display("exchange task failed: {source}"))]
    ExchangeTaskFailed {
        stage: &'static str,
        source: tokio::task::JoinError,
    },
}

/// How one exchange ended.
#[derive(Debug)]
pub enum ExchangeOutcome {
    Completed { message: Message },
    Failed { error: ChatError },
    Cancelled,
}

/// Everything observers may want to react to, fragment by fragment.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    SessionsChanged,
    ExchangeStarted {
        exchange_id: ExchangeId,
        session_id: SessionId,
    },
    ExchangeStreaming {
        exchange_id: ExchangeId,
    },
    Fragment {
        exchange_id: ExchangeId,
        text: String,
    },
    ExchangeCompleted {
        exchange_id: ExchangeId,
        session_id: SessionId,
        message: Message,
    },
    ExchangeFailed {
        exchange_id: ExchangeId,
        error: String,
    },
    ExchangeCancelled {
        exchange_id: ExchangeId,
    },
}

#[derive(Debug, Clone)]
pub struct CoreOptions {
    pub probe_timeout: Duration,
    pub commit_partial_on_failure: bool,
    pub event_capacity: usize,
}

impl Default for CoreOptions {
    fn default() -> Self {
        Self::from(&AppSettings::default())
    }
}

impl From<&AppSettings> for CoreOptions {
    fn from(settings: &AppSettings) -> Self {
        Self {
            probe_timeout: Duration::from_millis(settings.probe_timeout_ms),
            commit_partial_on_failure: settings.commit_partial_on_failure,
            event_capacity: settings.event_capacity.max(1),
        }
    }
}

/// A running exchange. Dropping the handle leaves the exchange running.
#[derive(Debug)]
pub struct ExchangeHandle {
    id: ExchangeId,
    task: JoinHandle<ExchangeOutcome>,
}

impl ExchangeHandle {
    pub fn id(&self) -> ExchangeId {
        self.id
    }

    pub async fn wait(self) -> Result<ExchangeOutcome, ChatError> {
        self.task.await.context(ExchangeTaskFailedSnafu {
            stage: "exchange-wait",
        })
    }
}

struct ActiveExchange {
    id: ExchangeId,
    cancel_tx: oneshot::Sender<()>,
}

struct ChatInner {
    backend: Arc<dyn GenerateBackend>,
    monitor: ConnectionMonitor,
    store: Mutex<SessionStore>,
    active: Mutex<Option<ActiveExchange>>,
    next_exchange_id: AtomicU64,
    commit_partial_on_failure: bool,
    exchange_state_tx: watch::Sender<ExchangeState>,
    live_preview_tx: watch::Sender<String>,
    last_error_tx: watch::Sender<Option<String>>,
    events_tx: broadcast::Sender<ChatEvent>,
}

/// The chat client core: conversations, backend status and the single
/// in-flight exchange, with watch channels for every piece of visible state.
#[derive(Clone)]
pub struct ChatCore {
    inner: Arc<ChatInner>,
}

impl ChatCore {
    pub fn new(
        backend: Arc<dyn GenerateBackend>,
        store: SessionStore,
        options: CoreOptions,
    ) -> Self {
        let (exchange_state_tx, _) = watch::channel(ExchangeState::Idle);
        let (live_preview_tx, _) = watch::channel(String::new());
        let (last_error_tx, _) = watch::channel(None);
        let (events_tx, _) = broadcast::channel(options.event_capacity.max(1));

        Self {
            inner: Arc::new(ChatInner {
                monitor: ConnectionMonitor::new(Arc::clone(&backend), options.probe_timeout),
                backend,
                store: Mutex::new(store),
                active: Mutex::new(None),
                next_exchange_id: AtomicU64::new(1),
                commit_partial_on_failure: options.commit_partial_on_failure,
                exchange_state_tx,
                live_preview_tx,
                last_error_tx,
                events_tx,
            }),
        }
    }

    /// Builds the core against the configured backend and storage, loading history.
    pub async fn from_settings(settings: &AppSettings) -> Result<Self, ChatError> {
        let backend = OllamaClient::new(&settings.endpoint).context(BackendSnafu {
            stage: "core-build-backend",
        })?;

        let kv: Arc<dyn KeyValueStore> = match settings.storage_backend {
            StorageBackend::File => Arc::new(FileKeyValueStore::new(settings.data_dir.clone())),
            StorageBackend::Sqlite => {
                let location = settings.sqlite_path();
                let store = SqliteKeyValueStore::open(&location)
                    .await
                    .context(StorageSnafu {
                        stage: "core-open-sqlite",
                    })?;
                Arc::new(store)
            }
        };

        let mut store = SessionStore::new(kv, settings.default_model.clone());
        store.load();

        tracing::info!(
            endpoint = %backend.endpoint(),
            storage_backend = ?settings.storage_backend,
            data_dir = ?settings.data_dir,
            "chat core ready"
        );
        Ok(Self::new(Arc::new(backend), store, CoreOptions::from(settings)))
    }

    pub fn list_sessions(&self) -> Vec<Session> {
        self.inner.lock_store().sessions().to_vec()
    }

    pub fn session(&self, session_id: SessionId) -> Option<Session> {
        self.inner.lock_store().session(session_id).cloned()
    }

    pub fn current_session(&self) -> Option<Session> {
        self.inner.lock_store().current_session().cloned()
    }

    pub fn current_session_id(&self) -> Option<SessionId> {
        self.inner.lock_store().current_session_id()
    }

    pub fn default_model(&self) -> String {
        self.inner.lock_store().default_model().to_string()
    }

    pub fn create_session(&self) -> Session {
        let session = {
            let mut store = self.inner.lock_store();
            let model = store.default_model().to_string();
            store.create_session(model)
        };
        self.inner.emit(ChatEvent::SessionsChanged);
        session
    }

    pub fn select_session(&self, session_id: SessionId) -> Result<(), ChatError> {
        {
            let mut store = self.inner.lock_store();
            ensure!(
                store.session(session_id).is_some(),
                SessionNotFoundSnafu {
                    stage: "select-session",
                    session_id,
                }
            );
            store.set_current_session(Some(session_id));
        }
        self.inner.emit(ChatEvent::SessionsChanged);
        Ok(())
    }

    /// Removes a conversation; unknown ids are ignored.
    pub fn delete_session(&self, session_id: SessionId) {
        self.inner.lock_store().delete_session(session_id);
        self.inner.emit(ChatEvent::SessionsChanged);
    }

    pub fn set_model(&self, session_id: SessionId, model: &str) -> Result<(), ChatError> {
        let model = model.trim();
        if model.is_empty() {
            return Ok(());
        }

        self.inner
            .lock_store()
            .set_session_model(session_id, model)
            .map_err(|error| session_error("set-session-model", session_id, error))?;
        self.inner.emit(ChatEvent::SessionsChanged);
        Ok(())
    }

    /// Remembers `model` as the default and moves the current conversation onto it.
    pub fn select_model(&self, model: &str) {
        let model = model.trim();
        if model.is_empty() {
            return;
        }

        {
            let mut store = self.inner.lock_store();
            store.set_default_model(model);
            if let Some(session_id) = store.current_session_id()
                && let Err(error) = store.set_session_model(session_id, model)
            {
                tracing::warn!(session_id = %session_id, error = %error, "current session vanished");
            }
        }
        self.inner.emit(ChatEvent::SessionsChanged);
    }

    pub async fn refresh_models(&self) -> Result<Vec<Model>, ChatError> {
        self.inner
            .backend
            .list_models()
            .await
            .context(BackendSnafu {
                stage: "refresh-models",
            })
    }

    pub async fn check_connection(&self) -> ConnectionStatus {
        self.inner.monitor.check_status().await
    }

    pub fn connection_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.monitor.subscribe()
    }

    pub fn exchange_state(&self) -> watch::Receiver<ExchangeState> {
        self.inner.exchange_state_tx.subscribe()
    }

    pub fn live_preview(&self) -> watch::Receiver<String> {
        self.inner.live_preview_tx.subscribe()
    }

    pub fn last_error(&self) -> watch::Receiver<Option<String>> {
        self.inner.last_error_tx.subscribe()
    }

    pub fn clear_error(&self) {
        self.inner.last_error_tx.send_replace(None);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ChatEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Records `text` as a user message in the current conversation and starts
    /// streaming the reply on a background task.
    pub fn submit(&self, text: &str) -> Result<ExchangeHandle, ChatError> {
        // Any attempt while a reply streams is busy, even an empty one.
        ensure!(
            !self.inner.exchange_state_tx.borrow().is_active(),
            BusySnafu {
                stage: "submit-idle-check",
            }
        );

        let prompt = text.trim();
        ensure!(
            !prompt.is_empty(),
            EmptyPromptSnafu {
                stage: "submit-validate",
            }
        );

        let status = self.inner.monitor.status();
        ensure!(
            status == ConnectionStatus::Connected,
            NotConnectedSnafu {
                stage: "submit-connection",
                status,
            }
        );

        let exchange_id = ExchangeId::new(self.inner.next_exchange_id.fetch_add(1, Ordering::Relaxed));
        let (cancel_tx, cancel_rx) = oneshot::channel();

        let (session_id, request) = {
            let mut store = self.inner.lock_store();
            let session = store.current_session().context(NoCurrentSessionSnafu {
                stage: "submit-current-session",
            })?;
            let session_id = session.id;
            let model = if session.model.trim().is_empty() {
                store.default_model().to_string()
            } else {
                session.model.clone()
            };

            if let Err(rejection) = self.inner.transition(ExchangeTransition::Begin(exchange_id)) {
                tracing::debug!(exchange_id = %exchange_id, ?rejection, "submit rejected");
                return BusySnafu {
                    stage: "submit-begin",
                }
                .fail();
            }
            *self.inner.lock_active() = Some(ActiveExchange {
                id: exchange_id,
                cancel_tx,
            });

            if let Err(error) = store.append_message(session_id, Message::user(prompt)) {
                drop(store);
                let error = session_error("submit-append-user", session_id, error);
                self.inner.abandon(exchange_id, &error);
                return Err(error);
            }

            (session_id, GenerateRequest::new(model, prompt))
        };

        self.inner.live_preview_tx.send_replace(String::new());
        self.inner.last_error_tx.send_replace(None);
        self.inner.emit(ChatEvent::ExchangeStarted {
            exchange_id,
            session_id,
        });
        tracing::debug!(
            exchange_id = %exchange_id,
            session_id = %session_id,
            model = %request.model,
            "exchange started"
        );

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            inner
                .run_exchange(exchange_id, session_id, request, cancel_rx)
                .await
        });

        Ok(ExchangeHandle {
            id: exchange_id,
            task,
        })
    }

    /// Stops the in-flight exchange, discarding its text. Returns whether
    /// there was one to stop.
    pub fn cancel(&self) -> bool {
        let inner = &self.inner;
        let Some(exchange_id) = inner.exchange_state_tx.borrow().active_exchange() else {
            return false;
        };

        if let Err(rejection) = inner.transition(ExchangeTransition::Cancel(exchange_id)) {
            tracing::debug!(exchange_id = %exchange_id, ?rejection, "cancel lost a race");
            return false;
        }

        let active = inner
            .lock_active()
            .take_if(|active| active.id == exchange_id);
        if let Some(active) = active {
            let _ = active.cancel_tx.send(());
        }

        tracing::debug!(exchange_id = %exchange_id, "exchange cancelled");
        inner.emit(ChatEvent::ExchangeCancelled { exchange_id });
        inner.finish(exchange_id);
        true
    }
}

impl ChatInner {
    fn lock_store(&self) -> MutexGuard<'_, SessionStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveExchange>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ChatEvent) {
        let _ = self.events_tx.send(event);
    }

    fn accepts(&self, exchange_id: ExchangeId) -> bool {
        self.exchange_state_tx
            .borrow()
            .accepts_stream_event(exchange_id)
    }

    fn transition(&self, transition: ExchangeTransition) -> ExchangeTransitionResult {
        let mut outcome = Ok(ExchangeState::Idle);
        self.exchange_state_tx
            .send_if_modified(|state| match state.apply(transition) {
                Ok(next) => {
                    let changed = *state != next;
                    *state = next.clone();
                    outcome = Ok(next);
                    changed
                }
                Err(rejection) => {
                    outcome = Err(rejection);
                    false
                }
            });
        outcome
    }

    // Returns to idle only if this exchange is still the one that just ended.
    fn finish(&self, exchange_id: ExchangeId) {
        self.exchange_state_tx.send_if_modified(|state| {
            if !state.is_terminal_for(exchange_id) {
                return false;
            }
            match state.apply(ExchangeTransition::ResetToIdle) {
                Ok(next) => {
                    *state = next;
                    true
                }
                Err(_) => false,
            }
        });

        let _ = self
            .lock_active()
            .take_if(|active| active.id == exchange_id);

        if !self.exchange_state_tx.borrow().is_active() {
            self.live_preview_tx.send_replace(String::new());
        }
    }

    fn abandon(&self, exchange_id: ExchangeId, error: &ChatError) {
        let _ = self.transition(ExchangeTransition::Fail {
            id: exchange_id,
            message: error.to_string(),
        });
        self.last_error_tx.send_replace(Some(error.to_string()));
        self.finish(exchange_id);
    }

    async fn run_exchange(
        &self,
        exchange_id: ExchangeId,
        session_id: SessionId,
        request: GenerateRequest,
        mut cancel_rx: oneshot::Receiver<()>,
    ) -> ExchangeOutcome {
        if !self.accepts(exchange_id) {
            return ExchangeOutcome::Cancelled;
        }

        let GenerateStreamHandle { mut stream, worker } =
            match self.backend.generate_stream(request) {
                Ok(handle) => handle,
                Err(source) => {
                    let error = ChatError::Backend {
                        stage: "exchange-open-stream",
                        source,
                    };
                    return self.fail_exchange(exchange_id, session_id, String::new(), error);
                }
            };
        tokio::spawn(worker);

        let mut accumulated = String::new();
        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    stream.cancel();
                    return ExchangeOutcome::Cancelled;
                }
                event = stream.recv() => {
                    let Some(event) = event else {
                        let error = StreamClosedSnafu {
                            stage: "exchange-stream-closed",
                        }
                        .build();
                        return self.fail_exchange(exchange_id, session_id, accumulated, error);
                    };
                    if !self.accepts(exchange_id) {
                        stream.cancel();
                        return ExchangeOutcome::Cancelled;
                    }

                    match event {
                        StreamEvent::Opened => {
                            if self.transition(ExchangeTransition::Open(exchange_id)).is_ok() {
                                self.emit(ChatEvent::ExchangeStreaming { exchange_id });
                            }
                        }
                        StreamEvent::Fragment(text) => {
                            accumulated.push_str(&text);
                            self.live_preview_tx
                                .send_modify(|preview| preview.push_str(&text));
                            self.emit(ChatEvent::Fragment { exchange_id, text });
                        }
                        StreamEvent::Done => {
                            return self.complete_exchange(exchange_id, session_id, accumulated);
                        }
                        StreamEvent::Error(source) => {
                            let error = ChatError::Backend {
                                stage: "exchange-stream",
                                source,
                            };
                            return self.fail_exchange(exchange_id, session_id, accumulated, error);
                        }
                    }
                }
            }
        }
    }

    fn complete_exchange(
        &self,
        exchange_id: ExchangeId,
        session_id: SessionId,
        text: String,
    ) -> ExchangeOutcome {
        let message = Message::assistant(text);

        // The store lock is held across the transition so no new exchange can
        // slip its user message in ahead of this reply.
        let committed = {
            let mut store = self.lock_store();
            if let Err(rejection) = self.transition(ExchangeTransition::Complete(exchange_id)) {
                tracing::debug!(exchange_id = %exchange_id, ?rejection, "dropping reply of an inactive exchange");
                return ExchangeOutcome::Cancelled;
            }
            store.append_message(session_id, message.clone())
        };

        match committed {
            Ok(()) => {
                self.emit(ChatEvent::ExchangeCompleted {
                    exchange_id,
                    session_id,
                    message: message.clone(),
                });
                self.finish(exchange_id);
                ExchangeOutcome::Completed { message }
            }
            Err(error) => {
                let error = session_error("exchange-commit-reply", session_id, error);
                tracing::warn!(
                    exchange_id = %exchange_id,
                    session_id = %session_id,
                    error = %error,
                    "reply finished after its conversation was deleted"
                );
                self.last_error_tx.send_replace(Some(error.to_string()));
                self.emit(ChatEvent::ExchangeFailed {
                    exchange_id,
                    error: error.to_string(),
                });
                self.finish(exchange_id);
                ExchangeOutcome::Failed { error }
            }
        }
    }

    fn fail_exchange(
        &self,
        exchange_id: ExchangeId,
        session_id: SessionId,
        partial: String,
        error: ChatError,
    ) -> ExchangeOutcome {
        let message = error.to_string();

        {
            let mut store = self.lock_store();
            let failed = ExchangeTransition::Fail {
                id: exchange_id,
                message: message.clone(),
            };
            if let Err(rejection) = self.transition(failed) {
                tracing::debug!(exchange_id = %exchange_id, ?rejection, "ignoring failure of an inactive exchange");
                return ExchangeOutcome::Cancelled;
            }

            if self.commit_partial_on_failure
                && !partial.trim().is_empty()
                && let Err(store_error) =
                    store.append_message(session_id, Message::assistant(partial))
            {
                tracing::warn!(
                    session_id = %session_id,
                    error = %store_error,
                    "failed to keep partial reply"
                );
            }
        }

        tracing::warn!(
            exchange_id = %exchange_id,
            session_id = %session_id,
            error = %message,
            "exchange failed"
        );
        self.last_error_tx.send_replace(Some(message.clone()));
        self.emit(ChatEvent::ExchangeFailed {
            exchange_id,
            error: message,
        });
        self.finish(exchange_id);
        ExchangeOutcome::Failed { error }
    }
}

fn session_error(stage: &'static str, session_id: SessionId, error: StorageError) -> ChatError {
    if error.is_not_found() {
        ChatError::SessionNotFound { stage, session_id }
    } else {
        ChatError::Storage {
            stage,
            source: error,
        }
    }
}
