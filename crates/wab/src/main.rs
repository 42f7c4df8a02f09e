use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use wab_bridge::BridgeConnector;
use wab_core::{
    config::Config,
    dispatch::Dispatcher,
    plugins::PluginRegistry,
    scheduler::BackgroundScheduler,
    services::BotServices,
    session::{SessionManager, SessionRegistry},
    settings::SettingsStore,
    vault::build_vault,
    vcf::{VcfDistributor, VcfManager},
};
use wab_http::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    wab_core::logging::init("wab")?;

    let cfg = Arc::new(Config::load()?);
    cfg.ensure_dirs()?;
    tracing::info!(
        "[MAIN] Starting {} v{} (bridge {})",
        cfg.bot_name,
        cfg.bot_version,
        cfg.bridge_url
    );

    let store = Arc::new(SettingsStore::open(&cfg).await);
    let vault = build_vault(&cfg)?;
    let vcf = Arc::new(VcfManager::from_config(&cfg));
    let registry = Arc::new(SessionRegistry::new());
    let distributor = Arc::new(VcfDistributor::new(
        vcf.clone(),
        store.clone(),
        registry.clone(),
        cfg.vcf_send_delay,
    ));
    let scheduler = BackgroundScheduler::new(cfg.clone(), store.clone(), distributor.clone());
    let services = Arc::new(BotServices::new(
        cfg.clone(),
        store.clone(),
        registry.clone(),
        distributor,
        scheduler.clone(),
    )?);

    let plugins = Arc::new(PluginRegistry::builtin());
    let dispatcher = Arc::new(Dispatcher::new(services.clone(), plugins));
    let connector = Arc::new(BridgeConnector::new(
        &cfg.bridge_url,
        cfg.bridge_token.clone(),
    )?);
    let sessions = SessionManager::new(
        cfg.clone(),
        connector,
        registry,
        store,
        vault,
        vcf,
        dispatcher,
    );

    let reload = sessions.clone();
    tokio::spawn(async move {
        match reload.reload_sessions().await {
            Ok(report) => tracing::info!(
                "[MAIN] Sessions reloaded: local={} restored={} skipped={} failed={}",
                report.local,
                report.restored,
                report.skipped,
                report.failed
            ),
            Err(e) => tracing::error!("[MAIN] Session reload failed: {e}"),
        }
    });

    let shutdown = CancellationToken::new();
    {
        let scheduler = scheduler.clone();
        let sessions = sessions.clone();
        let shutdown = shutdown.clone();
        let delay = cfg.scheduler_start_delay;
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = scheduler.start(sessions).await {
                        tracing::error!("[MAIN] Scheduler not started: {e}");
                    }
                }
            }
        });
    }

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("[MAIN] Signal handler failed: {e}");
                return;
            }
            tracing::info!("[MAIN] Shutdown requested");
            shutdown.cancel();
        });
    }

    let state = AppState::new(services, sessions.clone());
    let served = wab_http::serve(state, cfg.port, shutdown.clone())
        .await
        .context("control surface stopped");
    shutdown.cancel();

    scheduler.stop().await;
    sessions.shutdown().await;
    tracing::info!("[MAIN] Bye");
    served
}
