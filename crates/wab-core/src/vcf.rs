//! vCard files for connected users and the compiled contact network file.

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::{
    config::Config,
    domain::PhoneNumber,
    errors::Error,
    messaging::types::{DocumentAttachment, OutgoingMessage},
    session::SessionRegistry,
    settings::{SettingsStore, UserSettings},
    Result,
};

pub const VCARD_MIME: &str = "text/vcard";

#[derive(Clone, Debug)]
pub struct UserVcf {
    pub file_name: String,
    pub path: PathBuf,
    pub display_name: String,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledVcf {
    pub path: PathBuf,
    pub contact_count: usize,
    pub file_size: u64,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledVcfInfo {
    pub exists: bool,
    pub path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
}

/// Writes per-user `.vcf` files and the aggregate contact file.
pub struct VcfManager {
    dir: PathBuf,
    compiled_path: PathBuf,
    bot_name: String,
}

impl VcfManager {
    pub fn new(dir: impl Into<PathBuf>, bot_name: impl Into<String>) -> Self {
        let dir = dir.into();
        let bot_name = bot_name.into();
        let compiled_path = dir.join(format!("{}_contacts.vcf", slug(&bot_name)));
        Self {
            dir,
            compiled_path,
            bot_name,
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(&cfg.vcf_dir, &cfg.bot_name)
    }

    pub fn compiled_path(&self) -> &Path {
        &self.compiled_path
    }

    pub fn user_file_name(phone: &PhoneNumber) -> String {
        format!("{phone}.vcf")
    }

    /// Name used when neither a stored display name nor a push name exists.
    fn fallback_name(&self) -> String {
        let n: u32 = rand::thread_rng().gen_range(1000..10000);
        format!("{} {n}", self.bot_name)
    }

    pub fn render_vcard(&self, name: &str, phone: &PhoneNumber, rev: DateTime<Utc>) -> String {
        let name = escape_value(name);
        let mut out = String::new();
        out.push_str("BEGIN:VCARD\n");
        out.push_str("VERSION:3.0\n");
        out.push_str(&format!("FN:{name}\n"));
        out.push_str(&format!("N:{name};;;;\n"));
        out.push_str(&format!("TEL;TYPE=CELL:+{phone}\n"));
        out.push_str(&format!("ORG:{} Network\n", escape_value(&self.bot_name)));
        out.push_str(&format!(
            "NOTE:Connected via {} WhatsApp Bot - Contact shared only for bot users\n",
            escape_value(&self.bot_name)
        ));
        out.push_str(&format!("REV:{}\n", rev.format("%Y%m%dT%H%M%SZ")));
        out.push_str("END:VCARD\n");
        out
    }

    pub async fn create_user_vcf(
        &self,
        phone: &PhoneNumber,
        display_name: Option<&str>,
        push_name: Option<&str>,
    ) -> Result<UserVcf> {
        let name = display_name
            .or(push_name)
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| self.fallback_name());

        tokio::fs::create_dir_all(&self.dir).await?;
        let file_name = Self::user_file_name(phone);
        let path = self.dir.join(&file_name);
        tokio::fs::write(&path, self.render_vcard(&name, phone, Utc::now())).await?;
        tracing::info!("[VCF] Created {file_name} for {phone}");

        Ok(UserVcf {
            file_name,
            path,
            display_name: name,
        })
    }

    /// Rebuild the aggregate file from users that have a display name.
    ///
    /// Returns `None` (and removes any stale file) when there is nobody to list.
    pub async fn compile_all(&self, users: &[UserSettings]) -> Result<Option<CompiledVcf>> {
        let now = Utc::now();
        let mut body = String::new();
        let mut contact_count = 0usize;
        for user in users {
            let Some(name) = user.display_name.as_deref().filter(|n| !n.trim().is_empty()) else {
                continue;
            };
            body.push_str(&self.render_vcard(name, &user.phone_number, now));
            body.push('\n');
            contact_count += 1;
        }

        if contact_count == 0 {
            self.remove_compiled().await?;
            tracing::info!("[VCF] No contacts to compile");
            return Ok(None);
        }

        tokio::fs::create_dir_all(&self.dir).await?;
        let tmp = self.compiled_path.with_extension("vcf.tmp");
        tokio::fs::write(&tmp, body.as_bytes()).await?;
        tokio::fs::rename(&tmp, &self.compiled_path).await?;
        let file_size = tokio::fs::metadata(&self.compiled_path).await?.len();
        tracing::info!("[VCF] Compiled {contact_count} contacts");

        Ok(Some(CompiledVcf {
            path: self.compiled_path.clone(),
            contact_count,
            file_size,
        }))
    }

    async fn remove_compiled(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.compiled_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// `true` when a file was removed.
    pub async fn delete_user_vcf(&self, phone: &PhoneNumber) -> Result<bool> {
        let path = self.dir.join(Self::user_file_name(phone));
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                tracing::info!("[VCF] Deleted VCF for {phone}");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn compiled_info(&self) -> CompiledVcfInfo {
        let missing = CompiledVcfInfo {
            exists: false,
            path: self.compiled_path.clone(),
            file_size: None,
            contact_count: None,
            last_modified: None,
        };
        let Ok(meta) = tokio::fs::metadata(&self.compiled_path).await else {
            return missing;
        };
        let Ok(content) = tokio::fs::read_to_string(&self.compiled_path).await else {
            return missing;
        };

        CompiledVcfInfo {
            exists: true,
            path: self.compiled_path.clone(),
            file_size: Some(meta.len()),
            contact_count: Some(content.matches("BEGIN:VCARD").count()),
            last_modified: meta.modified().ok().map(DateTime::<Utc>::from),
        }
    }

    /// Document message carrying the compiled file.
    pub async fn compiled_document(&self, contact_count: usize) -> Result<OutgoingMessage> {
        let data = tokio::fs::read(&self.compiled_path).await?;
        Ok(OutgoingMessage::Document(DocumentAttachment {
            file_name: format!("{}_Contacts.vcf", self.bot_name.replace(' ', "")),
            mimetype: VCARD_MIME.to_string(),
            caption: Some(self.distribution_message(contact_count)),
            data,
        }))
    }

    pub fn distribution_message(&self, contact_count: usize) -> String {
        let bot = &self.bot_name;
        format!(
            "🎉 *Welcome to the {bot} Contact Network!* 📞\n\n\
             🔥 *Here's your exclusive VCF contact file!*\n\n\
             📊 *Total Contacts:* {contact_count} users\n\
             👥 *Network:* All {bot} connected users\n\n\
             💡 *How to use this file:*\n\
             📱 *Android:* open it with your Contacts app and tap Import\n\
             🍎 *iPhone:* tap the file and choose \"Add All Contacts\"\n\n\
             ✨ More contacts = more WhatsApp Status views!\n\
             🔐 Exclusive to {bot} users. We use your WhatsApp display name and number.\n\n\
             *© {bot} Team*"
        )
    }
}

fn slug(name: &str) -> String {
    let s: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect();
    if s.is_empty() {
        "bot".to_string()
    } else {
        s
    }
}

/// RFC 2426 text escaping.
fn escape_value(v: &str) -> String {
    let mut out = String::with_capacity(v.len());
    for c in v.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            ';' => out.push_str("\\;"),
            ',' => out.push_str("\\,"),
            '\n' => out.push_str("\\n"),
            '\r' => {}
            other => out.push(other),
        }
    }
    out
}

#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionReport {
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub contact_count: usize,
    pub sent: usize,
    pub failed: usize,
    /// Users with a display name but no open session.
    pub skipped: usize,
    pub errors: Vec<String>,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Sends the compiled contact file to every user with an open session.
pub struct VcfDistributor {
    vcf: Arc<VcfManager>,
    store: Arc<SettingsStore>,
    sessions: Arc<SessionRegistry>,
    send_delay: Duration,
    running: AtomicBool,
    last_report: Mutex<Option<DistributionReport>>,
}

impl VcfDistributor {
    pub fn new(
        vcf: Arc<VcfManager>,
        store: Arc<SettingsStore>,
        sessions: Arc<SessionRegistry>,
        send_delay: Duration,
    ) -> Self {
        Self {
            vcf,
            store,
            sessions,
            send_delay,
            running: AtomicBool::new(false),
            last_report: Mutex::new(None),
        }
    }

    pub fn vcf(&self) -> &VcfManager {
        &self.vcf
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn last_report(&self) -> Option<DistributionReport> {
        self.last_report.lock().await.clone()
    }

    /// Compile from every stored user.
    pub async fn compile_current(&self) -> Result<Option<CompiledVcf>> {
        let users = self.store.list_all().await?;
        self.vcf.compile_all(&users).await
    }

    /// One distribution run. Overlapping runs fail with `Error::Busy`.
    ///
    /// The running flag is released even when the returned future is dropped
    /// part way through.
    pub async fn distribute(&self) -> Result<DistributionReport> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::Busy(
                "VCF distribution already in progress".to_string(),
            ));
        }
        let res = {
            let _running = RunningGuard(&self.running);
            self.run().await
        };

        if let Ok(report) = &res {
            *self.last_report.lock().await = Some(report.clone());
        }
        res
    }

    async fn run(&self) -> Result<DistributionReport> {
        tracing::info!("[VCF] Starting distribution");
        let mut report = DistributionReport {
            started_at: Some(Utc::now()),
            ..Default::default()
        };

        let users = self.store.list_all().await?;
        let Some(compiled) = self.vcf.compile_all(&users).await? else {
            report.finished_at = Some(Utc::now());
            return Ok(report);
        };
        report.contact_count = compiled.contact_count;
        let document = self.vcf.compiled_document(compiled.contact_count).await?;

        let recipients = users
            .iter()
            .filter(|u| u.display_name.as_deref().is_some_and(|n| !n.trim().is_empty()));
        let mut first = true;
        for user in recipients {
            let phone = &user.phone_number;
            let Some(client) = self.sessions.open_client(phone) else {
                report.skipped += 1;
                tracing::debug!("[VCF] {phone} not connected, skipping");
                continue;
            };

            if !first && !self.send_delay.is_zero() {
                tokio::time::sleep(self.send_delay).await;
            }
            first = false;

            match client.send(&phone.jid(), document.clone()).await {
                Ok(_) => {
                    report.sent += 1;
                    tracing::info!("[VCF] Sent contact file to {phone}");
                }
                Err(e) => {
                    report.failed += 1;
                    report.errors.push(format!("{phone}: {e}"));
                    tracing::warn!("[VCF] Failed to send contact file to {phone}: {e}");
                }
            }
        }

        report.finished_at = Some(Utc::now());
        tracing::info!(
            "[VCF] Distribution done: sent={} failed={} skipped={} contacts={}",
            report.sent,
            report.failed,
            report.skipped,
            report.contact_count
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        session::{SessionHandle, SessionState},
        settings::{JsonFileBackend, SettingsPatch, SqliteBackend},
        test_support::{eventually, FakeClient},
    };
    use chrono::TimeZone;

    fn phone(s: &str) -> PhoneNumber {
        PhoneNumber::parse(s).unwrap()
    }

    #[test]
    fn vcard_has_expected_fields() {
        let m = VcfManager::new("/tmp/unused", "SHIZZY BOT");
        let rev = Utc.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap();
        let card = m.render_vcard("Ada; Lovelace", &phone("2348012345678"), rev);
        assert!(card.starts_with("BEGIN:VCARD\nVERSION:3.0\n"));
        assert!(card.contains("FN:Ada\\; Lovelace\n"));
        assert!(card.contains("N:Ada\\; Lovelace;;;;\n"));
        assert!(card.contains("TEL;TYPE=CELL:+2348012345678\n"));
        assert!(card.contains("ORG:SHIZZY BOT Network\n"));
        assert!(card.contains("REV:20240305T070809Z\n"));
        assert!(card.ends_with("END:VCARD\n"));
        assert!(m.compiled_path().ends_with("shizzybot_contacts.vcf"));
    }

    #[tokio::test]
    async fn user_vcf_falls_back_to_bot_name_with_digits() {
        let dir = tempfile::tempdir().unwrap();
        let m = VcfManager::new(dir.path(), "SHIZZY BOT");
        let out = m
            .create_user_vcf(&phone("1555"), None, Some("   "))
            .await
            .unwrap();
        assert_eq!(out.file_name, "1555.vcf");
        let suffix = out.display_name.strip_prefix("SHIZZY BOT ").unwrap();
        assert_eq!(suffix.len(), 4);
        assert!(suffix.chars().all(|c| c.is_ascii_digit()));
        assert!(out.path.exists());

        assert!(m.delete_user_vcf(&phone("1555")).await.unwrap());
        assert!(!m.delete_user_vcf(&phone("1555")).await.unwrap());
    }

    #[tokio::test]
    async fn compile_skips_nameless_users_and_reports_info() {
        let dir = tempfile::tempdir().unwrap();
        let m = VcfManager::new(dir.path(), "Bot");
        let mut a = UserSettings::defaults(phone("1001"));
        a.display_name = Some("Ada".to_string());
        let b = UserSettings::defaults(phone("1002"));
        let mut c = UserSettings::defaults(phone("1003"));
        c.display_name = Some("Cy".to_string());

        let compiled = m.compile_all(&[a, b, c]).await.unwrap().unwrap();
        assert_eq!(compiled.contact_count, 2);

        let info = m.compiled_info().await;
        assert!(info.exists);
        assert_eq!(info.contact_count, Some(2));
        assert_eq!(info.file_size, Some(compiled.file_size));

        // Nobody left: stale file goes away.
        assert!(m.compile_all(&[]).await.unwrap().is_none());
        assert!(!m.compiled_info().await.exists);
    }

    struct Network {
        distributor: Arc<VcfDistributor>,
        sessions: Arc<SessionRegistry>,
        _dir: tempfile::TempDir,
    }

    async fn network(send_delay: Duration, named: &[&str], unnamed: &[&str]) -> Network {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SettingsStore::new(
            Some(Arc::new(SqliteBackend::open_in_memory().unwrap())),
            JsonFileBackend::new(dir.path().join("users.json")),
        ));
        for (i, p) in named.iter().enumerate() {
            let patch = SettingsPatch {
                display_name: Some(format!("User {i}")),
                ..Default::default()
            };
            store.create(&phone(p), &patch).await.unwrap();
        }
        for p in unnamed {
            store.create(&phone(p), &SettingsPatch::default()).await.unwrap();
        }
        let sessions = Arc::new(SessionRegistry::new());
        let distributor = Arc::new(VcfDistributor::new(
            Arc::new(VcfManager::new(dir.path().join("vcf"), "Test Bot")),
            store,
            sessions.clone(),
            send_delay,
        ));
        Network {
            distributor,
            sessions,
            _dir: dir,
        }
    }

    fn connect(net: &Network, p: &str) -> (Arc<FakeClient>, SessionHandle) {
        let client = Arc::new(FakeClient::new());
        let handle = net.sessions.insert_open(&phone(p), client.clone());
        (client, handle)
    }

    #[tokio::test]
    async fn distribution_sends_to_open_sessions_and_counts_failures() {
        let net = network(
            Duration::from_millis(40),
            &["2001", "2002", "2003"],
            &["2004"],
        )
        .await;
        let (ok, _) = connect(&net, "2001");
        let (broken, _) = connect(&net, "2002");
        broken.fail_sends.store(true, Ordering::SeqCst);
        let (nameless, _) = connect(&net, "2004");

        let started = std::time::Instant::now();
        let report = net.distributor.distribute().await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(40));

        assert_eq!(report.contact_count, 3);
        assert_eq!(report.sent, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("2002: "));

        let sent = ok.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, phone("2001").jid());
        let OutgoingMessage::Document(doc) = &sent[0].1 else {
            panic!("expected a document, got {:?}", sent[0].1);
        };
        assert_eq!(doc.mimetype, VCARD_MIME);
        assert_eq!(doc.file_name, "TestBot_Contacts.vcf");
        assert!(String::from_utf8_lossy(&doc.data).contains("TEL;TYPE=CELL:+2003"));
        assert!(nameless.sent().is_empty());

        assert!(!net.distributor.is_running());
        assert_eq!(net.distributor.last_report().await.unwrap().sent, 1);
    }

    #[tokio::test]
    async fn overlapping_run_is_busy_and_abort_releases_the_flag() {
        let net = network(Duration::from_secs(30), &["3001", "3002"], &[]).await;
        let (first, _) = connect(&net, "3001");
        let (second, second_handle) = connect(&net, "3002");

        let distributor = net.distributor.clone();
        let run = tokio::spawn(async move { distributor.distribute().await });
        let a = first.clone();
        let b = second.clone();
        assert!(eventually(|| a.sent().len() + b.sent().len() == 1).await);
        assert!(net.distributor.is_running());

        let err = net.distributor.distribute().await.unwrap_err();
        assert!(matches!(err, Error::Busy(_)), "{err}");

        run.abort();
        assert!(run.await.unwrap_err().is_cancelled());
        assert!(!net.distributor.is_running());

        second_handle.set_state(SessionState::ClosedLoggedOut);
        let report = net.distributor.distribute().await.unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(report.skipped, 1);
    }
}
