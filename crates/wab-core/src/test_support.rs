//! In-memory fakes for the protocol, vault and storage ports.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::{
    config::{Config, VaultConfig},
    domain::{Jid, MessageKey, PhoneNumber},
    errors::Error,
    messaging::{
        port::{Connection, ProtocolConnector, WhatsAppClient},
        types::{
            AccountInfo, CallOffer, ClientCapabilities, GroupMetadata, IncomingMessage,
            MessageContent, OutgoingMessage, ParticipantAction, Presence, ProtocolEvent,
        },
    },
    session::{SessionEventHandler, SessionHandle},
    settings::{BackendKind, SettingsBackend, SettingsPatch, SqliteBackend, UserSettings},
    vault::{CredentialVault, ObjectKey, CREDS_FILE},
    Result,
};

pub(crate) fn phone(s: &str) -> PhoneNumber {
    PhoneNumber::parse(s).unwrap()
}

/// Config rooted in `root` with every delay zeroed.
pub(crate) fn test_config(root: &Path) -> Config {
    let mut cfg = Config::with_root(root);
    cfg.vault = VaultConfig::LocalDir(root.join("vault"));
    cfg.reconnect_delay = Duration::from_millis(20);
    cfg.restore_stagger = Duration::ZERO;
    cfg.pairing_settle = Duration::ZERO;
    cfg.send_global_interval = Duration::ZERO;
    cfg.send_per_chat_interval = Duration::ZERO;
    cfg.vcf_send_delay = Duration::ZERO;
    cfg.scheduler_start_delay = Duration::ZERO;
    cfg
}

pub(crate) fn text_message(
    chat: &str,
    sender: Option<&str>,
    from_me: bool,
    text: &str,
) -> IncomingMessage {
    IncomingMessage {
        key: MessageKey {
            remote_jid: Jid::new(chat),
            id: format!("MSG{}", text.len()),
            from_me,
            participant: sender.map(Jid::new),
        },
        push_name: Some("Tester".to_string()),
        timestamp: Some(1_700_000_000),
        content: MessageContent::Text {
            text: text.to_string(),
        },
        quoted: None,
    }
}

pub(crate) fn account(phone: &str) -> AccountInfo {
    AccountInfo {
        jid: Jid::new(format!("{phone}:7@s.whatsapp.net")),
        push_name: Some("Ada".to_string()),
    }
}

#[derive(Default)]
pub(crate) struct Recorded {
    pub sent: Vec<(Jid, OutgoingMessage)>,
    pub read: Vec<MessageKey>,
    pub presences: Vec<(Presence, Option<Jid>)>,
    pub rejected: Vec<String>,
    pub participant_updates: Vec<(Jid, Vec<Jid>, ParticipantAction)>,
    pub pairing_requests: Vec<Option<String>>,
    pub closed: usize,
}

pub(crate) struct FakeClient {
    pub recorded: Mutex<Recorded>,
    pub capabilities: ClientCapabilities,
    pub groups: Mutex<HashMap<Jid, GroupMetadata>>,
    pub pairing_code: String,
    pub fail_sends: AtomicBool,
}

impl FakeClient {
    pub fn new() -> Self {
        Self {
            recorded: Mutex::new(Recorded::default()),
            capabilities: ClientCapabilities {
                supports_buttons: true,
                supports_lists: true,
                supports_pairing_code: true,
            },
            groups: Mutex::new(HashMap::new()),
            pairing_code: "abcd1234".to_string(),
            fail_sends: AtomicBool::new(false),
        }
    }

    pub fn with_capabilities(mut self, caps: ClientCapabilities) -> Self {
        self.capabilities = caps;
        self
    }

    pub fn add_group(&self, meta: GroupMetadata) {
        self.groups.lock().unwrap().insert(meta.id.clone(), meta);
    }

    pub fn sent(&self) -> Vec<(Jid, OutgoingMessage)> {
        self.recorded.lock().unwrap().sent.clone()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|(_, m)| match m {
                OutgoingMessage::Text { text, .. } => Some(text),
                OutgoingMessage::Image { caption, .. } => caption,
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl WhatsAppClient for FakeClient {
    fn capabilities(&self) -> ClientCapabilities {
        self.capabilities
    }

    async fn send(&self, to: &Jid, message: OutgoingMessage) -> Result<Option<MessageKey>> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(Error::Protocol("send failed".to_string()));
        }
        let mut rec = self.recorded.lock().unwrap();
        rec.sent.push((to.clone(), message));
        Ok(Some(MessageKey {
            remote_jid: to.clone(),
            id: format!("SENT{}", rec.sent.len()),
            from_me: true,
            participant: None,
        }))
    }

    async fn read_messages(&self, keys: &[MessageKey]) -> Result<()> {
        self.recorded.lock().unwrap().read.extend_from_slice(keys);
        Ok(())
    }

    async fn send_presence(&self, presence: Presence, to: Option<&Jid>) -> Result<()> {
        self.recorded
            .lock()
            .unwrap()
            .presences
            .push((presence, to.cloned()));
        Ok(())
    }

    async fn reject_call(&self, call_id: &str, _from: &Jid) -> Result<()> {
        self.recorded
            .lock()
            .unwrap()
            .rejected
            .push(call_id.to_string());
        Ok(())
    }

    async fn group_metadata(&self, group: &Jid) -> Result<GroupMetadata> {
        self.groups
            .lock()
            .unwrap()
            .get(group)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("group {group}")))
    }

    async fn group_participants_update(
        &self,
        group: &Jid,
        participants: &[Jid],
        action: ParticipantAction,
    ) -> Result<()> {
        self.recorded.lock().unwrap().participant_updates.push((
            group.clone(),
            participants.to_vec(),
            action,
        ));
        Ok(())
    }

    async fn request_pairing_code(
        &self,
        _phone: &PhoneNumber,
        custom_code: Option<&str>,
    ) -> Result<String> {
        self.recorded
            .lock()
            .unwrap()
            .pairing_requests
            .push(custom_code.map(str::to_string));
        Ok(custom_code.unwrap_or(self.pairing_code.as_str()).to_string())
    }

    async fn close(&self) -> Result<()> {
        self.recorded.lock().unwrap().closed += 1;
        Ok(())
    }
}

/// Hands out `FakeClient`s and keeps the event senders so tests can drive sessions.
#[derive(Default)]
pub(crate) struct FakeConnector {
    senders: Mutex<HashMap<PhoneNumber, mpsc::Sender<ProtocolEvent>>>,
    clients: Mutex<HashMap<PhoneNumber, Arc<FakeClient>>>,
    connects: AtomicUsize,
    fail_next: AtomicUsize,
    auth_dirs: Mutex<Vec<PathBuf>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sender(&self, phone: &PhoneNumber) -> mpsc::Sender<ProtocolEvent> {
        self.senders.lock().unwrap().get(phone).cloned().unwrap()
    }

    pub fn client(&self, phone: &PhoneNumber) -> Arc<FakeClient> {
        self.clients.lock().unwrap().get(phone).cloned().unwrap()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn auth_dirs(&self) -> Vec<PathBuf> {
        self.auth_dirs.lock().unwrap().clone()
    }

    /// Wait until `n` connects have succeeded.
    pub async fn wait_connects(&self, n: usize) {
        for _ in 0..200 {
            if self.connects() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {n} connects, saw {}", self.connects());
    }
}

#[async_trait]
impl ProtocolConnector for FakeConnector {
    async fn connect(&self, phone: &PhoneNumber, auth_dir: &Path) -> Result<Connection> {
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::Protocol("connect refused".to_string()));
        }

        let creds = auth_dir.join(CREDS_FILE);
        if tokio::fs::metadata(&creds).await.is_err() {
            tokio::fs::write(&creds, format!("{{\"me\":\"{phone}\"}}")).await?;
        }
        self.auth_dirs.lock().unwrap().push(auth_dir.to_path_buf());

        let (tx, rx) = mpsc::channel(16);
        let client = Arc::new(FakeClient::new());
        self.senders.lock().unwrap().insert(phone.clone(), tx);
        self.clients.lock().unwrap().insert(phone.clone(), client.clone());
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Connection {
            client,
            events: rx,
        })
    }
}

/// Vault backed by a map.
#[derive(Default)]
pub(crate) struct FakeVault {
    pub objects: Mutex<HashMap<String, Vec<u8>>>,
    pub legacy: Mutex<HashMap<String, Vec<u8>>>,
    pub fail_puts: AtomicBool,
}

impl FakeVault {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.objects.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl CredentialVault for FakeVault {
    async fn put(&self, key: &ObjectKey, data: Vec<u8>) -> Result<String> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(Error::Vault("put refused".to_string()));
        }
        self.objects
            .lock()
            .unwrap()
            .insert(key.as_str().to_string(), data);
        Ok(key.reference())
    }

    async fn get(&self, key: &ObjectKey) -> Result<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(key.as_str())
            .cloned()
            .ok_or_else(|| Error::NotFound(key.as_str().to_string()))
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        self.objects.lock().unwrap().remove(key.as_str());
        Ok(())
    }

    async fn fetch_legacy(&self, url: &str) -> Result<Vec<u8>> {
        self.legacy
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| Error::Vault(format!("legacy download failed: {url}")))
    }
}

/// SQLite backend that can be switched into failing mode.
pub(crate) struct FlakyBackend {
    inner: SqliteBackend,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl FlakyBackend {
    pub fn new() -> Self {
        Self {
            inner: SqliteBackend::open_in_memory().unwrap(),
            failing: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Database("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SettingsBackend for FlakyBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    async fn get(&self, phone: &PhoneNumber) -> Result<Option<UserSettings>> {
        self.check()?;
        self.inner.get(phone).await
    }

    async fn upsert(&self, phone: &PhoneNumber, patch: &SettingsPatch) -> Result<UserSettings> {
        self.check()?;
        self.inner.upsert(phone, patch).await
    }

    async fn update(
        &self,
        phone: &PhoneNumber,
        patch: &SettingsPatch,
    ) -> Result<Option<UserSettings>> {
        self.check()?;
        self.inner.update(phone, patch).await
    }

    async fn delete(&self, phone: &PhoneNumber) -> Result<Option<UserSettings>> {
        self.check()?;
        self.inner.delete(phone).await
    }

    async fn put(&self, record: &UserSettings) -> Result<()> {
        self.check()?;
        self.inner.put(record).await
    }

    async fn list_all(&self) -> Result<Vec<UserSettings>> {
        self.check()?;
        self.inner.list_all().await
    }

    async fn ping(&self) -> Result<()> {
        self.check()?;
        self.inner.ping().await
    }
}

#[derive(Debug, Clone)]
pub(crate) enum HandlerEvent {
    Connected { phone: PhoneNumber, first_open: bool },
    Message { phone: PhoneNumber, text: Option<String> },
    Calls { phone: PhoneNumber, count: usize },
}

/// Session event handler that just records what it saw.
#[derive(Default)]
pub(crate) struct RecordingHandler {
    pub events: AsyncMutex<Vec<HandlerEvent>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> Vec<HandlerEvent> {
        self.events.lock().await.clone()
    }

    /// Poll until `pred` holds for the recorded events.
    pub async fn wait_until(&self, pred: impl Fn(&[HandlerEvent]) -> bool) {
        for _ in 0..200 {
            if pred(&self.events.lock().await) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("handler never observed expected events: {:?}", self.snapshot().await);
    }
}

#[async_trait]
impl SessionEventHandler for RecordingHandler {
    async fn on_connected(
        &self,
        session: &SessionHandle,
        _settings: &UserSettings,
        first_open: bool,
    ) {
        self.events.lock().await.push(HandlerEvent::Connected {
            phone: session.phone().clone(),
            first_open,
        });
    }

    async fn on_message(&self, session: &SessionHandle, message: IncomingMessage) {
        self.events.lock().await.push(HandlerEvent::Message {
            phone: session.phone().clone(),
            text: message.text().map(str::to_string),
        });
    }

    async fn on_calls(&self, session: &SessionHandle, offers: Vec<CallOffer>) {
        self.events.lock().await.push(HandlerEvent::Calls {
            phone: session.phone().clone(),
            count: offers.len(),
        });
    }
}

/// Poll `f` until it returns true or give up after ~2s.
pub(crate) async fn eventually(mut f: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if f() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
