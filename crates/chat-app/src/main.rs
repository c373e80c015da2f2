use cortex::{ChatCore, SettingsStore};

mod terminal;

#[tokio::main]
async fn main() {
    // stdout carries the conversation, logs go to stderr
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let settings_store = SettingsStore::load();
    let settings = settings_store.settings();
    tracing::info!(path = ?settings_store.config_path(), "settings loaded");

    let core = match ChatCore::from_settings(&settings).await {
        Ok(core) => core,
        Err(error) => {
            tracing::error!(error = %error, "failed to start chat core");
            std::process::exit(1);
        }
    };

    if let Err(error) = terminal::run(core).await {
        tracing::error!(error = %error, "terminal session ended with an error");
        std::process::exit(1);
    }
}
