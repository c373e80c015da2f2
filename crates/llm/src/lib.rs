pub mod decoder;
pub mod model;
pub mod ollama;
pub mod provider;

pub use decoder::{DecodeError, DecodeResult, Fragment, StreamDecoder};
pub use model::Model;
pub use ollama::{DEFAULT_ENDPOINT, OLLAMA_PROVIDER_ID, OllamaClient};
pub use provider::{
    BoxFuture, GenerateBackend, GenerateEventStream, GenerateRequest, GenerateStreamHandle,
    ProviderError, ProviderResult, ProviderWorker, StreamEvent, make_event_stream, pump_body,
};
