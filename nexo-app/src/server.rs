//! Nexo server: wire the store, model, bridge and gateway together.

use crate::config::NexoConfig;
use crate::gateway::Gateway;
use crate::pipeline::ConversationPipeline;
use crate::repo::{HistoryRepo, RuleRepo, TenantRepo};
use crate::router::MessageRouter;
use crate::store::{PathStore, RtdbStore};
use crate::supervisor::ReconnectSupervisor;
use anyhow::{Context, Result};
use nexo_llm::GeminiClient;
use nexo_platform::{PlatformConnector, WhatsAppBridgeConnector};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = NexoConfig::load(config_path).await?;
    let gateway = build_gateway(&cfg)?;

    let store = build_store(&cfg)?;
    let tenants = TenantRepo::new(store);

    // Sessions are brought up for every active tenant at boot; the rest are
    // created on demand through request_session.
    let active = tenants
        .list_active()
        .await
        .context("listing active tenants")?;
    tracing::info!(tenants = active.len(), "bootstrapping sessions");
    for tenant in &active {
        gateway.request_session(tenant);
    }

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(%e, "ctrl-c handler failed");
            }
            shutdown.cancel();
        });
    }

    tracing::info!(model = %cfg.general.model, "nexo running");
    shutdown.cancelled().await;
    tracing::info!("shutting down");
    Ok(())
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = NexoConfig::load(config_path).await?;
    tracing::info!(
        model = %cfg.general.model,
        bridge_url = %cfg.platform.bridge_url,
        debounce_window_secs = cfg.debounce.window_seconds,
        reconnect_max_attempts = cfg.reconnect.max_attempts,
        "config ok"
    );

    let store = build_store(&cfg)?;
    let tenants = TenantRepo::new(store);
    let active = tenants
        .list_active()
        .await
        .context("store reachability check")?;
    tracing::info!(active_tenants = active.len(), "store ok");
    Ok(())
}

fn build_gateway(cfg: &NexoConfig) -> Result<Gateway> {
    let store = build_store(cfg)?;
    let tenants = TenantRepo::new(Arc::clone(&store));

    let api_key = cfg
        .keys
        .gemini_api_key
        .as_deref()
        .context("keys.gemini_api_key is required (or set GEMINI_API_KEY)")?;
    let llm = Arc::new(GeminiClient::new(api_key, &cfg.general.model));

    let connector: Arc<dyn PlatformConnector> = Arc::new(
        WhatsAppBridgeConnector::new(&cfg.platform.bridge_url)?
            .with_api_token(cfg.platform.api_token.clone())
            .with_poll_interval(Duration::from_millis(cfg.platform.poll_interval_ms)),
    );

    let supervisor = Arc::new(ReconnectSupervisor::new(
        tenants.clone(),
        cfg.reconnect.max_attempts,
        cfg.reconnect.delay(),
    ));
    let router = MessageRouter::new(RuleRepo::new(Arc::clone(&store)));
    let pipeline = ConversationPipeline::new(tenants, HistoryRepo::new(store), llm)
        .with_persona(cfg.general.persona.clone());

    Ok(Gateway::new(
        connector,
        supervisor,
        router,
        pipeline,
        cfg.debounce.window(),
    ))
}

fn build_store(cfg: &NexoConfig) -> Result<Arc<dyn PathStore>> {
    let store = RtdbStore::new(&cfg.store.base_url)?
        .with_auth_token(cfg.store.auth_token.clone());
    Ok(Arc::new(store))
}
