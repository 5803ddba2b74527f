use std::sync::Arc;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use autodebug::api::{self, AppState};
use autodebug::config::Config;
use autodebug::llm::{LlmClient, OpenRouterClient};
use autodebug::memory::init_memory;
use autodebug::sandbox::{LocalSandbox, SandboxManager};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "autodebug=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    let llm: Arc<dyn LlmClient> = match &config.api_key {
        Some(key) => Arc::new(OpenRouterClient::new(key.clone())),
        None => {
            anyhow::bail!("OPENROUTER_API_KEY is required to run the server");
        }
    };

    let sandbox = Arc::new(SandboxManager::new(
        Arc::new(LocalSandbox::new()),
        config.sandbox.max_concurrent,
    ));
    let memory = init_memory(&config.memory, config.api_key.as_deref()).await;

    let host = config.host.clone();
    let port = config.port;
    let state = AppState::new(config, llm, sandbox, memory);
    api::serve(state, &host, port).await
}
