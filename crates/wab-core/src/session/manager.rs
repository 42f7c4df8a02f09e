use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::Utc;
use serde::Serialize;
use tokio::{sync::mpsc, time::sleep};

use crate::{
    config::Config,
    domain::PhoneNumber,
    errors::Error,
    messaging::{
        port::ProtocolConnector,
        throttled::{ThrottleConfig, ThrottledClient},
        types::{AccountInfo, DisconnectReason, ProtocolEvent},
    },
    session::{
        registry::Claim, SessionEventHandler, SessionHandle, SessionOrigin, SessionRegistry,
        SessionState,
    },
    settings::{SettingsPatch, SettingsStore},
    vault::{BackupReference, CredentialVault, ObjectKey, CREDS_FILE},
    vcf::VcfManager,
    Result,
};

#[derive(Clone, Debug, Default, Serialize)]
pub struct ReloadReport {
    pub local: usize,
    pub restored: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Drives every session: connect, post-connect bookkeeping, reconnect, teardown.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    cfg: Arc<Config>,
    connector: Arc<dyn ProtocolConnector>,
    registry: Arc<SessionRegistry>,
    store: Arc<SettingsStore>,
    vault: Arc<dyn CredentialVault>,
    vcf: Arc<VcfManager>,
    handler: Arc<dyn SessionEventHandler>,
    throttle: ThrottleConfig,
}

impl SessionManager {
    pub fn new(
        cfg: Arc<Config>,
        connector: Arc<dyn ProtocolConnector>,
        registry: Arc<SessionRegistry>,
        store: Arc<SettingsStore>,
        vault: Arc<dyn CredentialVault>,
        vcf: Arc<VcfManager>,
        handler: Arc<dyn SessionEventHandler>,
    ) -> Self {
        let throttle = ThrottleConfig {
            global_min_interval: cfg.send_global_interval,
            per_chat_min_interval: cfg.send_per_chat_interval,
        };
        Self {
            inner: Arc::new(ManagerInner {
                cfg,
                connector,
                registry,
                store,
                vault,
                vcf,
                handler,
                throttle,
            }),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.inner.registry
    }

    pub fn active_connections(&self) -> usize {
        self.inner.registry.open_count()
    }

    pub fn session_states(&self) -> Vec<(PhoneNumber, SessionState)> {
        self.inner
            .registry
            .handles()
            .into_iter()
            .map(|h| (h.phone().clone(), h.state()))
            .collect()
    }

    fn auth_dir(&self, phone: &PhoneNumber, origin: SessionOrigin) -> PathBuf {
        match origin {
            SessionOrigin::Fresh => self.inner.cfg.sessions_dir.join(phone.as_str()),
            SessionOrigin::Restored => self.inner.cfg.restored_sessions_dir.join(phone.as_str()),
        }
    }

    /// Start (or return) the session for `phone` using the local auth directory.
    pub async fn create_session(&self, phone: &PhoneNumber) -> Result<SessionHandle> {
        self.start(phone, SessionOrigin::Fresh).await
    }

    async fn start(&self, phone: &PhoneNumber, origin: SessionOrigin) -> Result<SessionHandle> {
        let auth_dir = self.auth_dir(phone, origin);
        let handle = match self.inner.registry.claim(phone, origin, auth_dir.clone()) {
            Claim::Existing(h) => {
                tracing::debug!("[SESSION] {phone} already {}", h.state());
                return Ok(h);
            }
            Claim::New(h) => h,
        };

        if let Err(e) = tokio::fs::create_dir_all(&auth_dir).await {
            self.inner.registry.remove_exact(&handle);
            return Err(e.into());
        }

        tracing::info!("[SESSION] Connecting {phone} ({origin})");
        match self.connect(&handle).await {
            Ok(events) => {
                self.spawn_driver(handle.clone(), Some(events));
                Ok(handle)
            }
            Err(e) => {
                tracing::warn!(
                    "[SESSION] Connect failed for {phone}: {e}; retrying in {:?}",
                    self.inner.cfg.reconnect_delay
                );
                handle.set_state(SessionState::ClosedReconnect);
                self.spawn_driver(handle.clone(), None);
                Err(e)
            }
        }
    }

    async fn connect(&self, handle: &SessionHandle) -> Result<mpsc::Receiver<ProtocolEvent>> {
        handle.set_state(SessionState::Connecting);
        let conn = self
            .inner
            .connector
            .connect(handle.phone(), handle.auth_dir())
            .await?;
        handle.set_client(Arc::new(ThrottledClient::new(
            conn.client,
            self.inner.throttle,
        )));
        Ok(conn.events)
    }

    fn spawn_driver(&self, handle: SessionHandle, events: Option<mpsc::Receiver<ProtocolEvent>>) {
        let mgr = self.clone();
        tokio::spawn(async move {
            mgr.drive(handle, events).await;
        });
    }

    /// One task per session. Events are handled strictly in order.
    async fn drive(&self, handle: SessionHandle, mut events: Option<mpsc::Receiver<ProtocolEvent>>) {
        let phone = handle.phone().clone();
        let cancel = handle.cancel_token();
        let delay = self.inner.cfg.reconnect_delay;

        'session: loop {
            let mut rx = match events.take() {
                Some(rx) => rx,
                None => {
                    tokio::select! {
                        _ = cancel.cancelled() => break 'session,
                        _ = sleep(delay) => {}
                    }
                    tracing::info!("[SESSION] Reconnecting {phone}");
                    match self.connect(&handle).await {
                        Ok(rx) => rx,
                        Err(e) => {
                            tracing::warn!("[SESSION] Reconnect failed for {phone}: {e}");
                            handle.set_state(SessionState::ClosedReconnect);
                            continue 'session;
                        }
                    }
                }
            };

            let reason = loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break 'session,
                    ev = rx.recv() => ev,
                };
                match event {
                    None => break DisconnectReason::ConnectionLost,
                    Some(ProtocolEvent::Closed { reason }) => break reason,
                    Some(ProtocolEvent::Open { account }) => self.on_open(&handle, account).await,
                    Some(ProtocolEvent::Message { message }) => {
                        self.inner.handler.on_message(&handle, message).await
                    }
                    Some(ProtocolEvent::Call { offers }) => {
                        self.inner.handler.on_calls(&handle, offers).await
                    }
                    Some(ProtocolEvent::CredsUpdated) => {
                        tracing::debug!("[SESSION] Credentials updated for {phone}")
                    }
                }
            };

            handle.take_client();
            if reason.is_logged_out() {
                tracing::info!("[SESSION] {phone} logged out, tearing down");
                handle.set_state(SessionState::ClosedLoggedOut);
                self.teardown(&phone, Some(&handle)).await;
                break 'session;
            }

            tracing::info!("[SESSION] {phone} closed ({reason:?}), reconnecting in {delay:?}");
            handle.set_state(SessionState::ClosedReconnect);
        }

        tracing::debug!("[SESSION] Driver for {phone} stopped");
    }

    async fn on_open(&self, handle: &SessionHandle, account: AccountInfo) {
        let phone = handle.phone().clone();
        tracing::info!("[SESSION] {phone} connected as {}", account.jid);
        handle.set_account(account.clone());
        handle.set_state(SessionState::Open);
        let first_open = handle.mark_opened();

        let existing = match self.inner.store.get(&phone).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("[SESSION] Could not read settings for {phone}: {e}");
                None
            }
        };
        let stored_ref = existing.as_ref().and_then(|s| s.session_id.clone());

        let mut patch = SettingsPatch::default();
        match self.backup_credentials(&phone).await {
            Some(reference) => patch.session_id = Some(reference),
            None if stored_ref.is_none() => {
                patch.session_id = Some(BackupReference::local(&phone))
            }
            None => {}
        }

        let display_name = existing.as_ref().and_then(|s| s.display_name.clone());
        match self
            .inner
            .vcf
            .create_user_vcf(&phone, display_name.as_deref(), account.push_name.as_deref())
            .await
        {
            Ok(v) => {
                patch.display_name = Some(v.display_name);
                patch.vcf_file_name = Some(v.file_name);
                patch.last_vcf_update = Some(Utc::now());
            }
            Err(e) => tracing::warn!("[SESSION] VCF creation failed for {phone}: {e}"),
        }

        let settings = match self.inner.store.create(&phone, &patch).await {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("[SESSION] Failed to save settings for {phone}: {e}");
                self.inner.store.get_with_defaults(&phone).await
            }
        };

        self.inner
            .handler
            .on_connected(handle, &settings, first_open)
            .await;
    }

    fn creds_path(&self, phone: &PhoneNumber) -> PathBuf {
        let dir = self
            .inner
            .registry
            .get(phone)
            .map(|h| h.auth_dir().to_path_buf())
            .unwrap_or_else(|| self.auth_dir(phone, SessionOrigin::Fresh));
        dir.join(CREDS_FILE)
    }

    /// Upload the local credential blob; `None` when disabled or on any error.
    pub async fn backup_credentials(&self, phone: &PhoneNumber) -> Option<String> {
        if !self.inner.vault.is_configured() {
            tracing::debug!("[BACKUP] Vault not configured, skipping backup for {phone}");
            return None;
        }

        let path = self.creds_path(phone);
        let data = match tokio::fs::read(&path).await {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!("[BACKUP] No credentials for {phone} at {}: {e}", path.display());
                return None;
            }
        };

        match self
            .inner
            .vault
            .put(&ObjectKey::for_phone(phone), data)
            .await
        {
            Ok(reference) => {
                tracing::info!("[BACKUP] Credentials for {phone} stored at {reference}");
                Some(reference)
            }
            Err(e) => {
                tracing::warn!("[BACKUP] Upload failed for {phone}: {e}");
                None
            }
        }
    }

    async fn write_restored_creds(&self, phone: &PhoneNumber, blob: &[u8]) -> Result<PathBuf> {
        let dir = self.auth_dir(phone, SessionOrigin::Restored);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(CREDS_FILE);
        tokio::fs::write(&path, blob).await?;
        Ok(path)
    }

    /// Download a legacy backup, store it under the per-user key and point the
    /// settings record at the new reference.
    pub async fn migrate_legacy_session(&self, phone: &PhoneNumber, url: &str) -> Result<String> {
        tracing::info!("[MIGRATE] Migrating legacy backup for {phone}");
        let blob = self.inner.vault.fetch_legacy(url).await?;
        self.write_restored_creds(phone, &blob).await?;

        let reference = self
            .inner
            .vault
            .put(&ObjectKey::for_phone(phone), blob)
            .await?;
        let patch = SettingsPatch {
            session_id: Some(reference.clone()),
            ..Default::default()
        };
        self.inner.store.create(phone, &patch).await?;
        tracing::info!("[MIGRATE] {phone} now backed up at {reference}");
        Ok(reference)
    }

    /// Resume a session from its stored backup reference.
    pub async fn restore_session(
        &self,
        phone: &PhoneNumber,
        reference: &str,
    ) -> Result<SessionHandle> {
        if let Some(h) = self.inner.registry.get(phone) {
            if h.state().is_live() {
                return Ok(h);
            }
        }

        let parsed = match BackupReference::parse(reference, &self.inner.cfg.legacy_backup_prefix) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("[RESTORE] Unusable backup reference for {phone}: {e}; deleting session");
                self.delete_session(phone).await;
                return Err(e);
            }
        };

        let restored_creds = self
            .auth_dir(phone, SessionOrigin::Restored)
            .join(CREDS_FILE);

        match parsed {
            BackupReference::Local(_) => {
                let local_creds = self.auth_dir(phone, SessionOrigin::Fresh).join(CREDS_FILE);
                if file_exists(&local_creds).await {
                    return self.start(phone, SessionOrigin::Fresh).await;
                }
                if file_exists(&restored_creds).await {
                    return self.start(phone, SessionOrigin::Restored).await;
                }
                Err(Error::NotFound(format!("no local credentials for {phone}")))
            }
            BackupReference::Legacy(url) => {
                if let Err(e) = self.migrate_legacy_session(phone, &url).await {
                    if !file_exists(&restored_creds).await {
                        return Err(e);
                    }
                    tracing::warn!("[MIGRATE] Migration for {phone} incomplete, keeping legacy reference: {e}");
                }
                self.start(phone, SessionOrigin::Restored).await
            }
            BackupReference::Remote(key) => {
                let blob = self.inner.vault.get(&key).await?;
                self.write_restored_creds(phone, &blob).await?;
                tracing::info!("[RESTORE] Restored credentials for {phone} from {}", key.as_str());
                self.start(phone, SessionOrigin::Restored).await
            }
        }
    }

    /// Stop the session and remove everything it owns.
    pub async fn delete_session(&self, phone: &PhoneNumber) {
        self.teardown(phone, None).await;
    }

    async fn teardown(&self, phone: &PhoneNumber, owner: Option<&SessionHandle>) {
        let handle = match owner {
            Some(h) => self.inner.registry.remove_exact(h).then(|| h.clone()),
            None => self.inner.registry.remove(phone),
        };
        if let Some(h) = handle {
            h.cancel();
            h.set_state(SessionState::ClosedLoggedOut);
            if let Some(client) = h.take_client() {
                if let Err(e) = client.close().await {
                    tracing::debug!("[SESSION] Close failed for {phone}: {e}");
                }
            }
        }

        for origin in [SessionOrigin::Fresh, SessionOrigin::Restored] {
            remove_dir_if_exists(&self.auth_dir(phone, origin)).await;
        }

        if let Err(e) = self.inner.vcf.delete_user_vcf(phone).await {
            tracing::warn!("[SESSION] Could not delete VCF for {phone}: {e}");
        }

        let record = match self.inner.store.delete(phone).await {
            Ok(r) => r,
            Err(e) => {
                tracing::error!("[SESSION] Could not delete settings for {phone}: {e}");
                None
            }
        };

        if self.inner.vault.is_configured() {
            let mut keys = vec![ObjectKey::for_phone(phone)];
            let stored = record.as_ref().and_then(|r| r.session_id.as_deref()).map(|raw| {
                BackupReference::parse(raw, &self.inner.cfg.legacy_backup_prefix)
            });
            if let Some(Ok(BackupReference::Remote(key))) = stored {
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
            for key in keys {
                if let Err(e) = self.inner.vault.delete(&key).await {
                    tracing::warn!("[BACKUP] Could not delete {}: {e}", key.as_str());
                }
            }
        }

        match self.inner.store.list_all().await {
            Ok(users) => {
                if let Err(e) = self.inner.vcf.compile_all(&users).await {
                    tracing::warn!("[VCF] Recompile after deleting {phone} failed: {e}");
                }
            }
            Err(e) => tracing::warn!("[VCF] Could not list users for recompile: {e}"),
        }

        tracing::info!("[SESSION] Deleted session {phone}");
    }

    /// Bring back every known session: local auth directories first, then
    /// stored users that only have a remote backup.
    pub async fn reload_sessions(&self) -> Result<ReloadReport> {
        let mut report = ReloadReport::default();
        let stagger = self.inner.cfg.restore_stagger;
        let local = numeric_dirs(&self.inner.cfg.sessions_dir).await?;
        tracing::info!("[RELOAD] {} local session(s) found", local.len());

        let mut started_any = false;
        for phone in &local {
            if started_any && !stagger.is_zero() {
                sleep(stagger).await;
            }
            started_any = true;
            match self.create_session(phone).await {
                Ok(_) => report.local += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!("[RELOAD] {phone}: {e}");
                }
            }
        }

        let users = match self.inner.store.list_all().await {
            Ok(u) => u,
            Err(e) => {
                tracing::warn!("[RELOAD] Could not list stored users: {e}");
                Vec::new()
            }
        };
        for user in users {
            let phone = &user.phone_number;
            if local.contains(phone) || self.inner.registry.state_of(phone).is_live() {
                continue;
            }
            let Some(reference) = user.session_id.as_deref() else {
                report.skipped += 1;
                continue;
            };
            if started_any && !stagger.is_zero() {
                sleep(stagger).await;
            }
            started_any = true;
            match self.restore_session(phone, reference).await {
                Ok(_) => report.restored += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!("[RELOAD] Restore failed for {phone}: {e}");
                }
            }
        }

        tracing::info!(
            "[RELOAD] local={} restored={} skipped={} failed={}",
            report.local,
            report.restored,
            report.skipped,
            report.failed
        );
        Ok(report)
    }

    /// Delete everything but `creds.json` from stored users' auth directories.
    ///
    /// Sessions mid-handshake are left alone.
    pub async fn sweep_ephemeral_files(&self) -> Result<usize> {
        let users = self.inner.store.list_all().await?;
        let mut removed = 0usize;
        for user in users {
            let phone = &user.phone_number;
            if self.inner.registry.state_of(phone) == SessionState::Connecting {
                tracing::debug!("[CLEANUP] Skipping {phone} while connecting");
                continue;
            }
            for origin in [SessionOrigin::Fresh, SessionOrigin::Restored] {
                removed += prune_auth_dir(&self.auth_dir(phone, origin)).await;
            }
        }
        if removed > 0 {
            tracing::info!("[CLEANUP] Removed {removed} ephemeral session file(s)");
        }
        Ok(removed)
    }

    /// Start a session if needed and ask the protocol for a pairing code.
    pub async fn request_pairing_code(
        &self,
        phone: &PhoneNumber,
        custom_code: Option<&str>,
    ) -> Result<PairingCode> {
        let handle = self.create_session(phone).await?;
        let settle = self.inner.cfg.pairing_settle;
        if !settle.is_zero() {
            sleep(settle).await;
        }

        let client = handle
            .client()
            .ok_or_else(|| Error::Protocol(format!("session {phone} is not connected")))?;
        if !client.capabilities().supports_pairing_code {
            return Err(Error::Protocol(
                "protocol adapter does not support pairing codes".to_string(),
            ));
        }

        let fallback = self.inner.cfg.custom_pairing_code.as_str();
        let code = normalize_custom_code(custom_code.unwrap_or(fallback));
        let raw = client.request_pairing_code(phone, code.as_deref()).await?;
        tracing::info!("[PAIRING] Code issued for {phone}");
        Ok(PairingCode {
            code: format_pairing_code(&raw),
            custom_code: code,
        })
    }

    /// Stop every driver and close sockets (process shutdown).
    pub async fn shutdown(&self) {
        for handle in self.inner.registry.handles() {
            handle.cancel();
            if let Some(client) = handle.take_client() {
                let _ = client.close().await;
            }
        }
    }
}

/// Issued pairing code and the custom code that was sent along, if any.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PairingCode {
    pub code: String,
    pub custom_code: Option<String>,
}

/// Custom pairing codes are at most eight uppercase alphanumerics.
fn normalize_custom_code(raw: &str) -> Option<String> {
    let code: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .take(8)
        .collect();
    (!code.is_empty()).then_some(code)
}

/// `ABCDEFGH` -> `ABCD-EFGH`.
pub fn format_pairing_code(raw: &str) -> String {
    let chars: Vec<char> = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect();
    chars
        .chunks(4)
        .map(|c| c.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join("-")
}

async fn file_exists(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

async fn remove_dir_if_exists(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => tracing::debug!("[SESSION] Removed {}", dir.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("[SESSION] Could not remove {}: {e}", dir.display()),
    }
}

async fn numeric_dirs(root: &Path) -> Result<Vec<PhoneNumber>> {
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut out = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        if let Ok(phone) = PhoneNumber::parse(&name) {
            out.push(phone);
        }
    }
    out.sort();
    Ok(out)
}

async fn prune_auth_dir(dir: &Path) -> usize {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(e) => e,
        Err(_) => return 0,
    };
    let mut removed = 0usize;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let is_file = entry
            .file_type()
            .await
            .map(|t| t.is_file())
            .unwrap_or(false);
        if !is_file || entry.file_name() == CREDS_FILE {
            continue;
        }
        match tokio::fs::remove_file(entry.path()).await {
            Ok(()) => removed += 1,
            Err(e) => tracing::warn!("[CLEANUP] Could not remove {}: {e}", entry.path().display()),
        }
    }
    removed
}
