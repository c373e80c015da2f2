use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use snafu::ResultExt;
use tokio::sync::{mpsc, oneshot};

use super::model::{Model, ModelListPayload};
use super::provider::{
    BoxFuture, BuildClientSnafu, ConnectionSnafu, GenerateBackend, GenerateRequest,
    GenerateStreamHandle, HttpStatusSnafu, ModelPayloadParseSnafu, ProviderResult,
    ProviderWorker, ReadBodySnafu, StreamEvent, TimeoutSnafu, make_event_stream, pump_body,
};

pub const OLLAMA_PROVIDER_ID: &str = "ollama";
pub const DEFAULT_ENDPOINT: &str = "http://localhost:11434";

#[derive(Serialize)]
struct GenerateBody<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

/// HTTP client for an Ollama-compatible backend.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    http: reqwest::Client,
    endpoint: String,
}

impl OllamaClient {
    pub fn new(endpoint: &str) -> ProviderResult<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context(BuildClientSnafu {
                stage: "ollama-client-new",
            })?;

        Ok(Self {
            http,
            endpoint: normalize_endpoint(endpoint),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/api/{path}", self.endpoint)
    }

    async fn fetch_tags(&self, stage: &'static str) -> ProviderResult<reqwest::Response> {
        let url = self.api_url("tags");
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .context(ConnectionSnafu {
                stage,
                endpoint: url.clone(),
            })?;
        ensure_success(response, stage).await
    }

    async fn open_generate(
        http: &reqwest::Client,
        url: &str,
        request: &GenerateRequest,
    ) -> ProviderResult<reqwest::Response> {
        let body = GenerateBody {
            model: &request.model,
            prompt: &request.prompt,
            stream: true,
        };
        let response = http
            .post(url)
            .json(&body)
            .send()
            .await
            .context(ConnectionSnafu {
                stage: "ollama-generate-send",
                endpoint: url.to_string(),
            })?;
        ensure_success(response, "ollama-generate-status").await
    }

    async fn run_generate_worker(
        http: reqwest::Client,
        url: String,
        request: GenerateRequest,
        event_tx: mpsc::UnboundedSender<StreamEvent>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let opened = tokio::select! {
            _ = &mut cancel_rx => {
                tracing::debug!(model = %request.model, "generate request cancelled before response");
                return;
            }
            opened = Self::open_generate(&http, &url, &request) => opened,
        };

        let response = match opened {
            Ok(response) => response,
            Err(error) => {
                tracing::warn!(
                    model = %request.model,
                    url = %url,
                    error = %error,
                    "failed to open generate stream"
                );
                let _ = event_tx.send(StreamEvent::Error(error));
                return;
            }
        };

        if event_tx.send(StreamEvent::Opened).is_err() {
            return;
        }

        let body = response.bytes_stream().map(|chunk| {
            chunk.context(ReadBodySnafu {
                stage: "ollama-generate-read-body",
            })
        });
        pump_body(body, event_tx, cancel_rx).await;
    }
}

impl GenerateBackend for OllamaClient {
    fn id(&self) -> &str {
        OLLAMA_PROVIDER_ID
    }

    fn check_reachable<'a>(&'a self, timeout: Duration) -> BoxFuture<'a, ProviderResult<()>> {
        Box::pin(async move {
            let probe = self.fetch_tags("ollama-probe");
            match tokio::time::timeout(timeout, probe).await {
                Ok(result) => result.map(|_| ()),
                Err(_) => TimeoutSnafu {
                    stage: "ollama-probe-timeout",
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                }
                .fail(),
            }
        })
    }

    fn list_models<'a>(&'a self) -> BoxFuture<'a, ProviderResult<Vec<Model>>> {
        Box::pin(async move {
            let response = self.fetch_tags("ollama-list-models").await?;
            let payload = response.text().await.context(ReadBodySnafu {
                stage: "ollama-list-models-read",
            })?;
            let parsed: ModelListPayload =
                serde_json::from_str(&payload).context(ModelPayloadParseSnafu {
                    stage: "ollama-list-models-parse",
                })?;
            Ok(parsed.models)
        })
    }

    fn generate_stream(&self, request: GenerateRequest) -> ProviderResult<GenerateStreamHandle> {
        let (event_tx, stream, cancel_rx) = make_event_stream();
        let worker: ProviderWorker = Box::pin(Self::run_generate_worker(
            self.http.clone(),
            self.api_url("generate"),
            request,
            event_tx,
            cancel_rx,
        ));

        Ok(GenerateStreamHandle { stream, worker })
    }
}

async fn ensure_success(
    response: reqwest::Response,
    stage: &'static str,
) -> ProviderResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    HttpStatusSnafu {
        stage,
        status: status.as_u16(),
        body,
    }
    .fail()
}

// Accepts both `http://host:11434` and the older `http://host:11434/api` form.
fn normalize_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim().trim_end_matches('/');
    let trimmed = trimmed.strip_suffix("/api").unwrap_or(trimmed);
    if trimmed.is_empty() {
        DEFAULT_ENDPOINT.to_string()
    } else {
        trimmed.to_string()
    }
}
