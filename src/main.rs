use anyhow::Context;

use llm_gateway::config::GatewayConfig;
use llm_gateway::persist::{schema, Store};
use llm_gateway::server::{router, AppState};
use llm_gateway::tools::ToolRegistry;

/// Conversation message cap; requests beyond it get `limit_exceeded`.
const MAX_MESSAGES_PER_CONVERSATION: usize = 1000;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = GatewayConfig::from_env();
    let port = config.port;

    let pool = schema::connect(&config.db_url)
        .await
        .with_context(|| format!("opening database {}", config.db_url))?;
    schema::ensure_schema(&pool).await.context("ensuring schema")?;

    let store = Store::new(pool, MAX_MESSAGES_PER_CONVERSATION);

    // Tool handlers are wired in by the embedding deployment; the gateway
    // itself ships none.
    let registry = ToolRegistry::new();

    let state = AppState::new(config, store, registry);
    let app = router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    log::info!("gateway listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    axum::serve(listener, app).await.context("serving")?;

    Ok(())
}
