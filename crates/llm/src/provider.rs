use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures::{Stream, StreamExt};
use snafu::Snafu;
use tokio::sync::{mpsc, oneshot};

use super::decoder::{DecodeError, StreamDecoder};
use super::model::Model;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateRequest {
    pub model: String,
    pub prompt: String,
}

impl GenerateRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into().trim().to_string(),
            prompt: prompt.into(),
        }
    }
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type ProviderWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProviderError {
    #[snafu(display("failed to build http client on `{stage}`, {source}"))]
    BuildClient {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("backend at {endpoint} is unreachable: {source}"))]
    Connection {
        stage: &'static str,
        endpoint: String,
        source: reqwest::Error,
    },
    #[snafu(display("backend returned status {status}: {body}"))]
    HttpStatus {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("failed to read response body on `{stage}`, {source}"))]
    ReadBody {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("failed to parse model list: {source}"))]
    ModelPayloadParse {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("{source}"))]
    Decode {
        stage: &'static str,
        source: DecodeError,
    },
    #[snafu(display("backend did not answer within {timeout_ms} ms"))]
    Timeout { stage: &'static str, timeout_ms: u64 },
}

impl ProviderError {
    /// Whether the backend itself could not be reached, as opposed to answering badly.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }
}

/// What a generate stream reports, in order: `Opened` once, then fragments,
/// then exactly one of `Done` or `Error`. Cancelled streams just stop.
#[derive(Debug)]
pub enum StreamEvent {
    Opened,
    Fragment(String),
    Done,
    Error(ProviderError),
}

pub struct GenerateEventStream {
    events: mpsc::UnboundedReceiver<StreamEvent>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

pub struct GenerateStreamHandle {
    pub stream: GenerateEventStream,
    pub worker: ProviderWorker,
}

impl GenerateEventStream {
    pub(crate) fn new(
        events: mpsc::UnboundedReceiver<StreamEvent>,
        cancel_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            events,
            cancel_tx: Some(cancel_tx),
        }
    }

    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StreamEvent> {
        self.events.try_recv().ok()
    }

    pub fn cancel(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }
}

impl Drop for GenerateEventStream {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

/// A local text-generation backend.
pub trait GenerateBackend: Send + Sync {
    fn id(&self) -> &str;
    fn check_reachable<'a>(&'a self, timeout: Duration) -> BoxFuture<'a, ProviderResult<()>>;
    fn list_models<'a>(&'a self) -> BoxFuture<'a, ProviderResult<Vec<Model>>>;
    fn generate_stream(&self, request: GenerateRequest) -> ProviderResult<GenerateStreamHandle>;
}

pub fn make_event_stream() -> (
    mpsc::UnboundedSender<StreamEvent>,
    GenerateEventStream,
    oneshot::Receiver<()>,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        event_tx,
        GenerateEventStream::new(event_rx, cancel_tx),
        cancel_rx,
    )
}

/// Feeds an NDJSON response body through a [`StreamDecoder`] and forwards
/// fragments until the terminal record, an error, or cancellation.
///
/// Returning drops `body`, which releases the underlying connection.
pub async fn pump_body<S, B>(
    body: S,
    event_tx: mpsc::UnboundedSender<StreamEvent>,
    mut cancel_rx: oneshot::Receiver<()>,
) where
    S: Stream<Item = ProviderResult<B>>,
    B: AsRef<[u8]>,
{
    let mut body = std::pin::pin!(body);
    let mut decoder = StreamDecoder::new();

    loop {
        tokio::select! {
            _ = &mut cancel_rx => {
                decoder.cancel();
                tracing::debug!("generate stream cancelled");
                return;
            }
            next_chunk = body.next() => {
                match next_chunk {
                    Some(Ok(chunk)) => decoder.feed(chunk.as_ref()),
                    Some(Err(error)) => {
                        tracing::warn!(error = %error, "generate stream body failed");
                        let _ = event_tx.send(StreamEvent::Error(error));
                        return;
                    }
                    None => decoder.close(),
                }
            }
        }

        while let Some(decoded) = decoder.next_fragment() {
            match decoded {
                Ok(fragment) => {
                    if !fragment.text.is_empty()
                        && event_tx.send(StreamEvent::Fragment(fragment.text)).is_err()
                    {
                        return;
                    }
                    if fragment.done {
                        let _ = event_tx.send(StreamEvent::Done);
                        return;
                    }
                }
                Err(source) => {
                    tracing::warn!(
                        error = %source,
                        raw = source.raw_segment().unwrap_or_default(),
                        "generate stream emitted an undecodable record"
                    );
                    let _ = event_tx.send(StreamEvent::Error(ProviderError::Decode {
                        stage: "pump-body-decode",
                        source,
                    }));
                    return;
                }
            }
        }

        if decoder.is_input_closed() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(
        parts: &[&'static str],
    ) -> impl Stream<Item = ProviderResult<&'static [u8]>> + Unpin + Send + use<> {
        futures::stream::iter(
            parts
                .iter()
                .copied()
                .map(|part| Ok(part.as_bytes()))
                .collect::<Vec<_>>(),
        )
    }

    async fn collect(mut stream: GenerateEventStream) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = stream.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn fragments_split_across_chunks_arrive_in_order() {
        let (event_tx, stream, cancel_rx) = make_event_stream();
        pump_body(
            chunks(&[
                "{\"response\":\"Hi\",\"done\":false}\n{\"response\":",
                "\"!\",\"done\":true}\n",
            ]),
            event_tx,
            cancel_rx,
        )
        .await;

        let events = collect(stream).await;
        assert!(matches!(
            events.as_slice(),
            [StreamEvent::Fragment(a), StreamEvent::Fragment(b), StreamEvent::Done]
                if a == "Hi" && b == "!"
        ));
    }

    #[tokio::test]
    async fn malformed_record_ends_with_decode_error() {
        let (event_tx, stream, cancel_rx) = make_event_stream();
        pump_body(
            chunks(&["{\"response\":\"ok\",\"done\":false}\n{oops}\n"]),
            event_tx,
            cancel_rx,
        )
        .await;

        let events = collect(stream).await;
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[1],
            StreamEvent::Error(ProviderError::Decode {
                source: DecodeError::MalformedRecord { .. },
                ..
            })
        ));
    }

    #[tokio::test]
    async fn truncated_body_reports_unexpected_end() {
        let (event_tx, stream, cancel_rx) = make_event_stream();
        pump_body(
            chunks(&["{\"response\":\"partial\",\"done\":false}\n"]),
            event_tx,
            cancel_rx,
        )
        .await;

        let events = collect(stream).await;
        assert!(matches!(
            events.last(),
            Some(StreamEvent::Error(ProviderError::Decode {
                source: DecodeError::UnexpectedEnd { .. },
                ..
            }))
        ));
    }

    #[tokio::test]
    async fn cancel_stops_a_stalled_body() {
        let (event_tx, mut stream, cancel_rx) = make_event_stream();
        let body = chunks(&["{\"response\":\"a\",\"done\":false}\n"])
            .chain(futures::stream::pending());
        let worker = tokio::spawn(pump_body(body, event_tx, cancel_rx));

        assert!(matches!(
            stream.recv().await,
            Some(StreamEvent::Fragment(text)) if text == "a"
        ));
        assert!(stream.cancel());
        worker.await.unwrap();

        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropping_the_stream_cancels_the_worker() {
        let (event_tx, stream, cancel_rx) = make_event_stream();
        let worker = tokio::spawn(pump_body(
            futures::stream::pending::<ProviderResult<&'static [u8]>>(),
            event_tx,
            cancel_rx,
        ));

        drop(stream);
        tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .unwrap()
            .unwrap();
    }
}
