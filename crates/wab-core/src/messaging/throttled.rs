use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::{
    domain::{Jid, MessageKey, PhoneNumber},
    messaging::{
        port::WhatsAppClient,
        types::{
            ClientCapabilities, GroupMetadata, OutgoingMessage, ParticipantAction, Presence,
        },
    },
    Result,
};

#[derive(Clone, Copy, Debug)]
pub struct ThrottleConfig {
    /// Minimum spacing between any two outbound calls on one connection.
    pub global_min_interval: Duration,
    /// Minimum spacing between messages to the same chat.
    pub per_chat_min_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            global_min_interval: Duration::from_millis(100),
            per_chat_min_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Debug)]
struct IntervalLimiter {
    interval: Duration,
    next: Instant,
}

impl IntervalLimiter {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: Instant::now(),
        }
    }

    /// Reserve the next slot and return how long to wait before using it.
    fn reserve(&mut self) -> Duration {
        let now = Instant::now();
        let start = if now >= self.next { now } else { self.next };
        self.next = start + self.interval;
        start.saturating_duration_since(now)
    }
}

/// `WhatsAppClient` decorator that spaces outbound calls.
///
/// Bulk senders (tagall, VCF distribution) go through this so a single account
/// does not burst past the server's spam heuristics.
pub struct ThrottledClient {
    inner: Arc<dyn WhatsAppClient>,
    cfg: ThrottleConfig,
    global: Mutex<IntervalLimiter>,
    per_chat: Mutex<HashMap<Jid, Arc<Mutex<IntervalLimiter>>>>,
}

impl ThrottledClient {
    pub fn new(inner: Arc<dyn WhatsAppClient>, cfg: ThrottleConfig) -> Self {
        Self {
            inner,
            cfg,
            global: Mutex::new(IntervalLimiter::new(cfg.global_min_interval)),
            per_chat: Mutex::new(HashMap::new()),
        }
    }

    async fn limiter_for_chat(&self, chat: &Jid) -> Arc<Mutex<IntervalLimiter>> {
        let mut map = self.per_chat.lock().await;
        map.entry(chat.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(IntervalLimiter::new(
                    self.cfg.per_chat_min_interval,
                )))
            })
            .clone()
    }

    async fn throttle_chat(&self, chat: &Jid) {
        let global_wait = { self.global.lock().await.reserve() };
        let chat_wait = {
            let lim = self.limiter_for_chat(chat).await;
            let mut guard = lim.lock().await;
            guard.reserve()
        };

        let wait = global_wait.max(chat_wait);
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }

    async fn throttle_global(&self) {
        let wait = { self.global.lock().await.reserve() };
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }
}

#[async_trait::async_trait]
impl WhatsAppClient for ThrottledClient {
    fn capabilities(&self) -> ClientCapabilities {
        self.inner.capabilities()
    }

    async fn send(&self, to: &Jid, message: OutgoingMessage) -> Result<Option<MessageKey>> {
        self.throttle_chat(to).await;
        self.inner.send(to, message).await
    }

    async fn read_messages(&self, keys: &[MessageKey]) -> Result<()> {
        self.throttle_global().await;
        self.inner.read_messages(keys).await
    }

    async fn send_presence(&self, presence: Presence, to: Option<&Jid>) -> Result<()> {
        // Presence is cheap and latency-sensitive; pass straight through.
        self.inner.send_presence(presence, to).await
    }

    async fn reject_call(&self, call_id: &str, from: &Jid) -> Result<()> {
        self.inner.reject_call(call_id, from).await
    }

    async fn group_metadata(&self, group: &Jid) -> Result<GroupMetadata> {
        self.throttle_global().await;
        self.inner.group_metadata(group).await
    }

    async fn group_participants_update(
        &self,
        group: &Jid,
        participants: &[Jid],
        action: ParticipantAction,
    ) -> Result<()> {
        self.throttle_chat(group).await;
        self.inner
            .group_participants_update(group, participants, action)
            .await
    }

    async fn request_pairing_code(
        &self,
        phone: &PhoneNumber,
        custom_code: Option<&str>,
    ) -> Result<String> {
        self.inner.request_pairing_code(phone, custom_code).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}
