use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use cortex_llm::{
    BoxFuture, GenerateBackend, GenerateRequest, GenerateStreamHandle, Model, OllamaClient,
    ProviderError, ProviderResult, ProviderWorker, StreamEvent, make_event_stream, pump_body,
};
use futures::StreamExt;

/// How the scripted backend answers the next generate call.
pub(crate) enum Reply {
    /// Opens, then streams these body chunks.
    Chunks(Vec<&'static str>),
    /// Opens, streams these chunks, then never finishes.
    Stall(Vec<&'static str>),
    /// Answers with a non-success status before any body.
    Status(u16),
    /// Sends the request to a port nobody listens on.
    Refused,
    /// Never answers; the request stays unopened until cancelled.
    Silent,
}

pub(crate) struct ScriptedBackend {
    reachable: bool,
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<GenerateRequest>>,
    models: Vec<Model>,
}

impl ScriptedBackend {
    pub(crate) fn reachable() -> Self {
        Self {
            reachable: true,
            replies: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            models: vec![
                Model::new("llama2").with_size(3_826_793_677),
                Model::new("mistral"),
            ],
        }
    }

    pub(crate) fn unreachable() -> Self {
        Self {
            reachable: false,
            ..Self::reachable()
        }
    }

    pub(crate) fn with_reply(self, reply: Reply) -> Self {
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(reply);
        self
    }

    pub(crate) fn requests(&self) -> Vec<GenerateRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn unreachable_error(timeout: Duration) -> ProviderError {
        ProviderError::Timeout {
            stage: "scripted-probe",
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

impl GenerateBackend for ScriptedBackend {
    fn id(&self) -> &str {
        "scripted"
    }

    fn check_reachable<'a>(&'a self, timeout: Duration) -> BoxFuture<'a, ProviderResult<()>> {
        Box::pin(async move {
            if self.reachable {
                Ok(())
            } else {
                Err(Self::unreachable_error(timeout))
            }
        })
    }

    fn list_models<'a>(&'a self) -> BoxFuture<'a, ProviderResult<Vec<Model>>> {
        Box::pin(async move {
            if self.reachable {
                Ok(self.models.clone())
            } else {
                Err(Self::unreachable_error(Duration::ZERO))
            }
        })
    }

    fn generate_stream(&self, request: GenerateRequest) -> ProviderResult<GenerateStreamHandle> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        let reply = self
            .replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or(Reply::Chunks(vec!["{\"response\":\"\",\"done\":true}\n"]));

        if let Reply::Refused = reply {
            return OllamaClient::new(&refused_endpoint())?.generate_stream(request);
        }

        let (event_tx, stream, cancel_rx) = make_event_stream();
        let worker: ProviderWorker = Box::pin(async move {
            let (parts, stall) = match reply {
                Reply::Silent => {
                    let _event_tx = event_tx;
                    let _ = cancel_rx.await;
                    return;
                }
                Reply::Refused => return,
                Reply::Status(status) => {
                    let _ = event_tx.send(StreamEvent::Error(ProviderError::HttpStatus {
                        stage: "scripted-status",
                        status,
                        body: "scripted failure".to_string(),
                    }));
                    return;
                }
                Reply::Chunks(parts) => (parts, false),
                Reply::Stall(parts) => (parts, true),
            };

            if event_tx.send(StreamEvent::Opened).is_err() {
                return;
            }
            let body = futures::stream::iter(
                parts
                    .into_iter()
                    .map(|part| Ok::<_, ProviderError>(part.as_bytes())),
            );
            if stall {
                pump_body(body.chain(futures::stream::pending()), event_tx, cancel_rx).await;
            } else {
                pump_body(body, event_tx, cancel_rx).await;
            }
        });

        Ok(GenerateStreamHandle { stream, worker })
    }
}

fn refused_endpoint() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{address}")
}
