#![deny(unsafe_code)]

pub mod exchange;
/// Backend reachability.
pub mod monitor;
/// Chat client core: conversations, the streaming exchange and its observers.
pub mod orchestrator;
/// Settings persistence.
pub mod settings;

#[cfg(test)]
mod testing;

pub use exchange::{ExchangeId, ExchangeState};
pub use monitor::{ConnectionMonitor, ConnectionStatus};
pub use orchestrator::{
    ChatCore, ChatError, ChatEvent, CoreOptions, ExchangeHandle, ExchangeOutcome,
};
pub use settings::{AppSettings, SettingsStore, StorageBackend};
