use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, RwLock,
    },
    time::Duration,
};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{
    domain::{Jid, PhoneNumber},
    messaging::{port::WhatsAppClient, types::AccountInfo},
    session::{SessionOrigin, SessionState},
};

struct Slot {
    phone: PhoneNumber,
    origin: SessionOrigin,
    auth_dir: PathBuf,
    state: watch::Sender<SessionState>,
    client: RwLock<Option<Arc<dyn WhatsAppClient>>>,
    account: RwLock<Option<AccountInfo>>,
    cancel: CancellationToken,
    opened_once: AtomicBool,
}

/// Shared view of one session slot.
#[derive(Clone)]
pub struct SessionHandle {
    slot: Arc<Slot>,
}

impl SessionHandle {
    fn new(phone: PhoneNumber, origin: SessionOrigin, auth_dir: PathBuf) -> Self {
        let (state, _) = watch::channel(SessionState::Connecting);
        Self {
            slot: Arc::new(Slot {
                phone,
                origin,
                auth_dir,
                state,
                client: RwLock::new(None),
                account: RwLock::new(None),
                cancel: CancellationToken::new(),
                opened_once: AtomicBool::new(false),
            }),
        }
    }

    /// Slot that is not tracked by any registry.
    #[cfg(test)]
    pub(crate) fn detached(phone: PhoneNumber, auth_dir: PathBuf) -> Self {
        let handle = Self::new(phone, SessionOrigin::Fresh, auth_dir);
        handle.set_state(SessionState::Open);
        handle
    }

    pub fn phone(&self) -> &PhoneNumber {
        &self.slot.phone
    }

    pub fn origin(&self) -> SessionOrigin {
        self.slot.origin
    }

    pub fn auth_dir(&self) -> &Path {
        &self.slot.auth_dir
    }

    pub fn state(&self) -> SessionState {
        *self.slot.state.borrow()
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        self.slot.state.send_replace(state);
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.slot.state.subscribe()
    }

    /// Wait until the state satisfies `pred`; `false` on timeout.
    pub async fn wait_for(
        &self,
        timeout: Duration,
        pred: impl FnMut(&SessionState) -> bool,
    ) -> bool {
        let mut rx = self.subscribe();
        tokio::time::timeout(timeout, async move { rx.wait_for(pred).await.is_ok() })
            .await
            .unwrap_or(false)
    }

    pub fn client(&self) -> Option<Arc<dyn WhatsAppClient>> {
        self.slot.client.read().ok().and_then(|c| c.clone())
    }

    pub(crate) fn set_client(&self, client: Arc<dyn WhatsAppClient>) {
        if let Ok(mut slot) = self.slot.client.write() {
            *slot = Some(client);
        }
    }

    pub(crate) fn take_client(&self) -> Option<Arc<dyn WhatsAppClient>> {
        self.slot.client.write().ok().and_then(|mut c| c.take())
    }

    pub fn account(&self) -> Option<AccountInfo> {
        self.slot.account.read().ok().and_then(|a| a.clone())
    }

    pub(crate) fn set_account(&self, account: AccountInfo) {
        if let Ok(mut slot) = self.slot.account.write() {
            *slot = Some(account);
        }
    }

    /// The bot's own chat: the account jid once known, the phone's jid otherwise.
    pub fn own_jid(&self) -> Jid {
        self.account()
            .map(|a| a.jid.normalized())
            .unwrap_or_else(|| self.slot.phone.jid())
    }

    /// `true` only for the first call.
    pub(crate) fn mark_opened(&self) -> bool {
        !self.slot.opened_once.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.slot.cancel.clone()
    }

    pub(crate) fn cancel(&self) {
        self.slot.cancel.cancel();
    }

    fn same_slot(&self, other: &SessionHandle) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }
}

pub(crate) enum Claim {
    Existing(SessionHandle),
    New(SessionHandle),
}

/// All session slots, keyed by phone number.
#[derive(Default)]
pub struct SessionRegistry {
    slots: Mutex<HashMap<PhoneNumber, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PhoneNumber, SessionHandle>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Return the live slot for `phone`, or install a fresh `Connecting` one.
    pub(crate) fn claim(
        &self,
        phone: &PhoneNumber,
        origin: SessionOrigin,
        auth_dir: PathBuf,
    ) -> Claim {
        let mut slots = self.lock();
        if let Some(existing) = slots.get(phone) {
            if existing.state().is_live() {
                return Claim::Existing(existing.clone());
            }
        }
        let handle = SessionHandle::new(phone.clone(), origin, auth_dir);
        slots.insert(phone.clone(), handle.clone());
        Claim::New(handle)
    }

    pub fn get(&self, phone: &PhoneNumber) -> Option<SessionHandle> {
        self.lock().get(phone).cloned()
    }

    /// Install an `Open` slot around `client` without a driver task.
    #[cfg(test)]
    pub(crate) fn insert_open(
        &self,
        phone: &PhoneNumber,
        client: Arc<dyn WhatsAppClient>,
    ) -> SessionHandle {
        let handle = SessionHandle::detached(phone.clone(), PathBuf::from(phone.as_str()));
        handle.set_client(client);
        self.lock().insert(phone.clone(), handle.clone());
        handle
    }

    pub(crate) fn remove(&self, phone: &PhoneNumber) -> Option<SessionHandle> {
        self.lock().remove(phone)
    }

    /// Remove `handle` only if it still owns its phone's slot.
    pub(crate) fn remove_exact(&self, handle: &SessionHandle) -> bool {
        let mut slots = self.lock();
        let owned = slots
            .get(handle.phone())
            .is_some_and(|current| current.same_slot(handle));
        if owned {
            slots.remove(handle.phone());
        }
        owned
    }

    pub fn handles(&self) -> Vec<SessionHandle> {
        let mut out: Vec<_> = self.lock().values().cloned().collect();
        out.sort_by(|a, b| a.phone().cmp(b.phone()));
        out
    }

    pub fn state_of(&self, phone: &PhoneNumber) -> SessionState {
        self.get(phone)
            .map(|h| h.state())
            .unwrap_or(SessionState::Uninitialized)
    }

    /// Client of an `Open` session.
    pub fn open_client(&self, phone: &PhoneNumber) -> Option<Arc<dyn WhatsAppClient>> {
        let handle = self.get(phone)?;
        if handle.state() != SessionState::Open {
            return None;
        }
        handle.client()
    }

    pub fn open_count(&self) -> usize {
        self.handles()
            .iter()
            .filter(|h| h.state() == SessionState::Open)
            .count()
    }

    pub fn open_phones(&self) -> Vec<PhoneNumber> {
        self.handles()
            .into_iter()
            .filter(|h| h.state() == SessionState::Open)
            .map(|h| h.phone().clone())
            .collect()
    }
}
