use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use crate::{
    config::Config, errors::Error, scheduler::BackgroundScheduler, session::SessionRegistry,
    settings::SettingsStore, vcf::VcfDistributor, Result,
};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared services handed to the dispatcher, the plugins and the HTTP layer.
pub struct BotServices {
    pub cfg: Arc<Config>,
    pub store: Arc<SettingsStore>,
    pub registry: Arc<SessionRegistry>,
    pub distributor: Arc<VcfDistributor>,
    pub scheduler: BackgroundScheduler,
    pub http: reqwest::Client,
    started_at: Instant,
}

impl BotServices {
    pub fn new(
        cfg: Arc<Config>,
        store: Arc<SettingsStore>,
        registry: Arc<SessionRegistry>,
        distributor: Arc<VcfDistributor>,
        scheduler: BackgroundScheduler,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::External(format!("http client build failed: {e}")))?;
        Ok(Self {
            cfg,
            store,
            registry,
            distributor,
            scheduler,
            http,
            started_at: Instant::now(),
        })
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}
