use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    domain::{Jid, MessageKey, PhoneNumber},
    messaging::types::{
        ClientCapabilities, GroupMetadata, OutgoingMessage, ParticipantAction, Presence,
        ProtocolEvent,
    },
    Result,
};

/// Handle to one live WhatsApp connection.
///
/// Implementations own the wire protocol; the bot only issues high-level calls.
#[async_trait]
pub trait WhatsAppClient: Send + Sync {
    fn capabilities(&self) -> ClientCapabilities;

    /// Send a message; returns the key of the sent message when the protocol reports one.
    async fn send(&self, to: &Jid, message: OutgoingMessage) -> Result<Option<MessageKey>>;

    async fn read_messages(&self, keys: &[MessageKey]) -> Result<()>;

    async fn send_presence(&self, presence: Presence, to: Option<&Jid>) -> Result<()>;

    async fn reject_call(&self, call_id: &str, from: &Jid) -> Result<()>;

    async fn group_metadata(&self, group: &Jid) -> Result<GroupMetadata>;

    async fn group_participants_update(
        &self,
        group: &Jid,
        participants: &[Jid],
        action: ParticipantAction,
    ) -> Result<()>;

    async fn request_pairing_code(
        &self,
        phone: &PhoneNumber,
        custom_code: Option<&str>,
    ) -> Result<String>;

    /// Close the socket without logging out.
    async fn close(&self) -> Result<()>;
}

/// A connection attempt that got as far as a socket.
pub struct Connection {
    pub client: Arc<dyn WhatsAppClient>,
    pub events: mpsc::Receiver<ProtocolEvent>,
}

/// Opens connections for a phone number using the auth state in `auth_dir`.
#[async_trait]
pub trait ProtocolConnector: Send + Sync {
    async fn connect(&self, phone: &PhoneNumber, auth_dir: &Path) -> Result<Connection>;
}
