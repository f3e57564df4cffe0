use std::env;

use anyhow::Context;
use serde_json::json;

use radiko_proxy_rs::{app_state::AppState, config::Config, http, logging::init_logger};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let logger = init_logger("radiko-proxy-rs");

    let config = Config::load().context("failed to load configuration")?;

    if matches!(env::args().nth(1).as_deref(), Some("check-config")) {
        logger.info(
            "config.check_passed",
            serde_json::to_value(&config).unwrap_or_else(|_| json!({ "status": "ok" })),
        );
        return Ok(());
    }

    let state = AppState::initialize(config.clone())
        .context("failed to initialize application state")?;

    logger.info(
        "server.initialized",
        json!({
            "host": config.host,
            "port": config.port,
            "resolveTtlSeconds": config.resolver.ttl_seconds,
            "segmentRetryAttempts": config.stream_proxy.retry_attempts,
        }),
    );

    http::serve(state).await.context("http server failed")
}
