use std::{
    collections::HashSet,
    future::Future,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, RwLock,
    },
    time::Duration,
};

use serde::Serialize;

use crate::{
    config::Config,
    domain::PhoneNumber,
    errors::Error,
    settings::{
        BackendKind, JsonFileBackend, SettingsBackend, SettingsPatch, SqliteBackend, UserSettings,
    },
    Result,
};

const CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, Serialize)]
pub struct StorageHealth {
    /// `healthy` when the configured backend answers, `degraded` on fallback.
    pub status: &'static str,
    pub backend: BackendKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStatus {
    pub primary_configured: bool,
    pub primary_available: bool,
    pub backend: BackendKind,
    pub fallback_path: PathBuf,
}

/// Settings store with a relational primary and a JSON-file fallback.
///
/// Primary errors never reach callers: the failing call is retried on the
/// fallback and the primary is marked unavailable until `probe_primary`
/// succeeds. Records written to the fallback while the primary is down are
/// merged back into it before it is used again.
pub struct SettingsStore {
    primary: RwLock<Option<Arc<dyn SettingsBackend>>>,
    reopen_path: Option<PathBuf>,
    fallback: Arc<JsonFileBackend>,
    available: AtomicBool,
    /// Deletes served by the fallback, replayed on the primary when it returns.
    pending_deletes: Mutex<HashSet<PhoneNumber>>,
}

impl SettingsStore {
    pub fn new(primary: Option<Arc<dyn SettingsBackend>>, fallback: JsonFileBackend) -> Self {
        let available = primary.is_some();
        Self {
            primary: RwLock::new(primary),
            reopen_path: None,
            fallback: Arc::new(fallback),
            available: AtomicBool::new(available),
            pending_deletes: Mutex::new(HashSet::new()),
        }
    }

    /// Open the configured database, retrying a few times before settling on
    /// the file fallback.
    pub async fn open(cfg: &Config) -> Self {
        let fallback = JsonFileBackend::new(&cfg.fallback_store_path);
        let Some(path) = cfg.database_path.clone() else {
            tracing::info!("[STORE] Database disabled, using {}", cfg.fallback_store_path.display());
            return Self::new(None, fallback);
        };

        let mut primary: Option<Arc<dyn SettingsBackend>> = None;
        for attempt in 1..=CONNECT_ATTEMPTS {
            match open_sqlite(path.clone()).await {
                Ok(db) => {
                    tracing::info!("[STORE] Connected to {}", path.display());
                    primary = Some(Arc::new(db));
                    break;
                }
                Err(e) => {
                    tracing::warn!(
                        "[STORE] Database connection attempt {attempt}/{CONNECT_ATTEMPTS} failed: {e}"
                    );
                    if attempt < CONNECT_ATTEMPTS {
                        tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                    }
                }
            }
        }
        if primary.is_none() {
            tracing::warn!("[STORE] Falling back to {}", cfg.fallback_store_path.display());
        }

        let store = Self {
            primary: RwLock::new(None),
            reopen_path: Some(path),
            fallback: Arc::new(fallback),
            available: AtomicBool::new(false),
            pending_deletes: Mutex::new(HashSet::new()),
        };
        if let Some(db) = primary {
            // Leftovers from an outage in a previous run.
            match store.merge_fallback(&db).await {
                Ok(()) => store.available.store(true, Ordering::SeqCst),
                Err(e) => tracing::warn!("[STORE] Could not merge fallback records: {e}"),
            }
            if let Ok(mut slot) = store.primary.write() {
                *slot = Some(db);
            }
        }
        store
    }

    pub fn primary_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn primary_handle(&self) -> Option<Arc<dyn SettingsBackend>> {
        self.primary.read().ok().and_then(|g| g.clone())
    }

    fn active_primary(&self) -> Option<Arc<dyn SettingsBackend>> {
        if !self.primary_available() {
            return None;
        }
        self.primary_handle()
    }

    fn mark_unavailable(&self, op: &str, err: &Error) {
        if self.available.swap(false, Ordering::SeqCst) {
            tracing::error!("[STORE] Primary backend failed during {op}, switching to file fallback: {err}");
        } else {
            tracing::warn!("[STORE] Primary backend error during {op}: {err}");
        }
    }

    async fn with_backend<T, F, Fut>(&self, op: &str, f: F) -> Result<T>
    where
        F: Fn(Arc<dyn SettingsBackend>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(primary) = self.active_primary() {
            match f(primary).await {
                Ok(v) => return Ok(v),
                Err(e) => self.mark_unavailable(op, &e),
            }
        }
        let fallback: Arc<dyn SettingsBackend> = self.fallback.clone();
        f(fallback).await
    }

    pub async fn get(&self, phone: &PhoneNumber) -> Result<Option<UserSettings>> {
        self.with_backend("get", |b| async move { b.get(phone).await })
            .await
    }

    /// Stored record or the default configuration. Never fails.
    pub async fn get_with_defaults(&self, phone: &PhoneNumber) -> UserSettings {
        match self.get(phone).await {
            Ok(Some(s)) => s,
            Ok(None) => UserSettings::defaults(phone.clone()),
            Err(e) => {
                tracing::error!("[STORE] Failed to read settings for {phone}: {e}");
                UserSettings::defaults(phone.clone())
            }
        }
    }

    /// Upsert: updates an existing record, otherwise inserts defaults + patch.
    pub async fn create(&self, phone: &PhoneNumber, patch: &SettingsPatch) -> Result<UserSettings> {
        self.with_backend("create", |b| async move { b.upsert(phone, patch).await })
            .await
    }

    /// `None` when no record exists; nothing is created.
    pub async fn update(
        &self,
        phone: &PhoneNumber,
        patch: &SettingsPatch,
    ) -> Result<Option<UserSettings>> {
        self.with_backend("update", |b| async move { b.update(phone, patch).await })
            .await
    }

    pub async fn delete(&self, phone: &PhoneNumber) -> Result<Option<UserSettings>> {
        let removed = self
            .with_backend("delete", |b| async move { b.delete(phone).await })
            .await?;
        if !self.primary_available() && self.primary_handle().is_some() {
            if let Ok(mut pending) = self.pending_deletes.lock() {
                pending.insert(phone.clone());
            }
        }
        Ok(removed)
    }

    pub async fn list_all(&self) -> Result<Vec<UserSettings>> {
        self.with_backend("list_all", |b| async move { b.list_all().await })
            .await
    }

    pub async fn health_check(&self) -> StorageHealth {
        let Some(primary) = self.active_primary() else {
            let configured = self.reopen_path.is_some() || self.primary_handle().is_some();
            return StorageHealth {
                status: if configured { "degraded" } else { "healthy" },
                backend: BackendKind::JsonFile,
                error: None,
            };
        };

        match primary.ping().await {
            Ok(()) => StorageHealth {
                status: "healthy",
                backend: primary.kind(),
                error: None,
            },
            Err(e) => {
                self.mark_unavailable("health_check", &e);
                StorageHealth {
                    status: "degraded",
                    backend: BackendKind::JsonFile,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Probe the primary regardless of its current flag and adopt the outcome.
    ///
    /// Reopens the database first when it never came up at startup.
    pub async fn probe_primary(&self) -> bool {
        let mut primary = self.primary_handle();
        if primary.is_none() {
            let Some(path) = self.reopen_path.clone() else {
                return false;
            };
            match open_sqlite(path).await {
                Ok(db) => {
                    let db: Arc<dyn SettingsBackend> = Arc::new(db);
                    if let Ok(mut slot) = self.primary.write() {
                        *slot = Some(db.clone());
                    }
                    primary = Some(db);
                }
                Err(e) => {
                    tracing::debug!("[STORE] Database still unreachable: {e}");
                    return false;
                }
            }
        }
        let Some(primary) = primary else {
            return false;
        };

        if let Err(e) = primary.ping().await {
            if self.available.swap(false, Ordering::SeqCst) {
                tracing::warn!("[STORE] Primary backend probe failed, using file fallback: {e}");
            }
            return false;
        }
        if self.primary_available() {
            return true;
        }

        if let Err(e) = self.merge_fallback(&primary).await {
            tracing::warn!("[STORE] Primary answers but fallback merge failed: {e}");
            return false;
        }
        self.available.store(true, Ordering::SeqCst);
        tracing::info!("[STORE] Primary backend restored");
        true
    }

    /// Move everything the fallback holds into `primary`.
    ///
    /// Per phone number the record with the newer `updated_at` wins. Deletes
    /// served by the fallback are replayed first. A fallback record is removed
    /// only once the primary holds it, and only if it was not rewritten in the
    /// meantime.
    async fn merge_fallback(&self, primary: &Arc<dyn SettingsBackend>) -> Result<()> {
        let deletes: Vec<PhoneNumber> = self
            .pending_deletes
            .lock()
            .map(|p| p.iter().cloned().collect())
            .unwrap_or_default();
        for phone in &deletes {
            primary.delete(phone).await?;
            if let Ok(mut pending) = self.pending_deletes.lock() {
                pending.remove(phone);
            }
        }

        let records = self.fallback.list_all().await?;
        let mut merged = 0usize;
        for record in records {
            let phone = record.phone_number.clone();
            let newer = match primary.get(&phone).await? {
                Some(existing) => record.updated_at > existing.updated_at,
                None => true,
            };
            if newer {
                primary.put(&record).await?;
                merged += 1;
            }
            let unchanged = self
                .fallback
                .get(&phone)
                .await?
                .is_some_and(|current| current.updated_at == record.updated_at);
            if unchanged {
                self.fallback.delete(&phone).await?;
            }
        }
        if merged > 0 || !deletes.is_empty() {
            tracing::info!(
                "[STORE] Merged {merged} fallback record(s) and {} delete(s) into primary",
                deletes.len()
            );
        }
        Ok(())
    }

    pub fn status(&self) -> StorageStatus {
        let available = self.primary_available();
        StorageStatus {
            primary_configured: self.reopen_path.is_some() || self.primary_handle().is_some(),
            primary_available: available,
            backend: if available {
                self.primary_handle()
                    .map(|p| p.kind())
                    .unwrap_or(BackendKind::JsonFile)
            } else {
                BackendKind::JsonFile
            },
            fallback_path: self.fallback.path().to_path_buf(),
        }
    }
}

async fn open_sqlite(path: PathBuf) -> Result<SqliteBackend> {
    tokio::task::spawn_blocking(move || SqliteBackend::open(&path))
        .await
        .map_err(|e| Error::External(format!("sqlite open task failed: {e}")))?
}
