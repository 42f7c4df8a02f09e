use serde::{Deserialize, Serialize};

use crate::domain::{Jid, MessageKey, PhoneNumber};

/// Identity of the connected account, reported when the connection opens.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountInfo {
    pub jid: Jid,
    #[serde(default)]
    pub push_name: Option<String>,
}

impl AccountInfo {
    pub fn phone_number(&self) -> Option<PhoneNumber> {
        self.jid.phone_number()
    }
}

/// Why a connection closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    LoggedOut,
    ConnectionClosed,
    ConnectionLost,
    ConnectionReplaced,
    TimedOut,
    RestartRequired,
    BadSession,
    #[serde(other)]
    Unknown,
}

impl DisconnectReason {
    /// Only an explicit logout ends a session for good.
    pub fn is_logged_out(self) -> bool {
        matches!(self, DisconnectReason::LoggedOut)
    }
}

/// Events emitted by a live connection, consumed one at a time per session.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProtocolEvent {
    Open { account: AccountInfo },
    Closed { reason: DisconnectReason },
    Message { message: IncomingMessage },
    Call { offers: Vec<CallOffer> },
    CredsUpdated,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingMessage {
    pub key: MessageKey,
    #[serde(default)]
    pub push_name: Option<String>,
    #[serde(default)]
    pub timestamp: Option<i64>,
    pub content: MessageContent,
    /// Content of the message this one replies to.
    #[serde(default)]
    pub quoted: Option<QuotedContent>,
}

/// Quoted message content. Media arrives as a URL the adapter already
/// downloaded and can send again.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QuotedContent {
    Text {
        text: String,
    },
    Image {
        url: String,
        #[serde(default)]
        caption: Option<String>,
    },
    Video {
        url: String,
        #[serde(default)]
        caption: Option<String>,
    },
    #[serde(other)]
    Unsupported,
}

/// Message payload, reduced to what the bot acts on.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    /// Plain conversation text.
    Text { text: String },
    /// Text with link preview, quote or mentions attached.
    ExtendedText { text: String },
    Media {
        kind: MediaKind,
        #[serde(default)]
        caption: Option<String>,
    },
    ButtonResponse { selected_id: String },
    ListResponse { selected_row_id: String },
    TemplateButtonReply { selected_id: String },
    /// Native-flow reply; the selection lives in the `id` field of `params_json`.
    InteractiveResponse { params_json: String },
    Reaction,
    Protocol,
    Ephemeral,
    #[serde(other)]
    Unsupported,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Document,
    Sticker,
}

impl IncomingMessage {
    pub fn chat(&self) -> &Jid {
        &self.key.remote_jid
    }

    /// Author of the message: the participant in groups, the chat otherwise.
    pub fn sender(&self) -> &Jid {
        self.key.participant.as_ref().unwrap_or(&self.key.remote_jid)
    }

    pub fn is_group(&self) -> bool {
        self.key.remote_jid.is_group()
    }

    pub fn from_me(&self) -> bool {
        self.key.from_me
    }

    /// Envelopes the pipeline never acts on.
    pub fn is_skippable(&self) -> bool {
        matches!(
            self.content,
            MessageContent::Protocol | MessageContent::Ephemeral | MessageContent::Unsupported
        )
    }

    /// Free text typed by the user (body or media caption).
    pub fn text(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text { text } | MessageContent::ExtendedText { text } => {
                Some(text.as_str())
            }
            MessageContent::Media { caption, .. } => caption.as_deref(),
            _ => None,
        }
    }

    /// Id picked from a button, list row, template button or native flow.
    pub fn selection_id(&self) -> Option<String> {
        match &self.content {
            MessageContent::ButtonResponse { selected_id }
            | MessageContent::TemplateButtonReply { selected_id } => Some(selected_id.clone()),
            MessageContent::ListResponse { selected_row_id } => Some(selected_row_id.clone()),
            MessageContent::InteractiveResponse { params_json } => {
                native_flow_selection(params_json)
            }
            _ => None,
        }
        .filter(|s| !s.trim().is_empty())
    }

    /// Plain conversation messages drive the presence features.
    pub fn is_conversation(&self) -> bool {
        matches!(self.content, MessageContent::Text { .. })
    }
}

fn native_flow_selection(params_json: &str) -> Option<String> {
    let v: serde_json::Value = serde_json::from_str(params_json).ok()?;
    v.get("id")?.as_str().map(|s| s.to_string())
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallOffer {
    pub id: String,
    pub from: Jid,
    #[serde(default = "default_call_status")]
    pub status: String,
}

fn default_call_status() -> String {
    "offer".to_string()
}

impl CallOffer {
    pub fn is_offer(&self) -> bool {
        self.status == "offer"
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Button {
    pub id: String,
    pub text: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListRow {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListSection {
    pub title: String,
    pub rows: Vec<ListRow>,
}

/// File sent as a document message. Uploaded out of band by adapters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DocumentAttachment {
    pub file_name: String,
    pub mimetype: String,
    pub caption: Option<String>,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutgoingMessage {
    Text {
        text: String,
        mentions: Vec<Jid>,
        quoted: Option<MessageKey>,
    },
    Image {
        url: String,
        caption: Option<String>,
    },
    Video {
        url: String,
        caption: Option<String>,
    },
    Audio {
        url: String,
        mimetype: String,
    },
    Document(DocumentAttachment),
    Buttons {
        text: String,
        footer: Option<String>,
        buttons: Vec<Button>,
    },
    List {
        title: String,
        text: String,
        footer: Option<String>,
        button_text: String,
        sections: Vec<ListSection>,
    },
    Contact {
        display_name: String,
        vcard: String,
    },
    Reaction {
        key: MessageKey,
        emoji: String,
    },
    Delete {
        key: MessageKey,
    },
}

impl OutgoingMessage {
    pub fn text(text: impl Into<String>) -> Self {
        OutgoingMessage::Text {
            text: text.into(),
            mentions: Vec::new(),
            quoted: None,
        }
    }

    pub fn reply(text: impl Into<String>, quoted: &MessageKey) -> Self {
        OutgoingMessage::Text {
            text: text.into(),
            mentions: Vec::new(),
            quoted: Some(quoted.clone()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OutgoingMessage::Text { .. } => "text",
            OutgoingMessage::Image { .. } => "image",
            OutgoingMessage::Video { .. } => "video",
            OutgoingMessage::Audio { .. } => "audio",
            OutgoingMessage::Document(_) => "document",
            OutgoingMessage::Buttons { .. } => "buttons",
            OutgoingMessage::List { .. } => "list",
            OutgoingMessage::Contact { .. } => "contact",
            OutgoingMessage::Reaction { .. } => "reaction",
            OutgoingMessage::Delete { .. } => "delete",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    Available,
    Unavailable,
    Composing,
    Recording,
    Paused,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantAction {
    Add,
    Remove,
    Promote,
    Demote,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GroupParticipant {
    pub id: Jid,
    #[serde(default)]
    pub admin: Option<String>,
}

impl GroupParticipant {
    pub fn is_admin(&self) -> bool {
        matches!(self.admin.as_deref(), Some("admin") | Some("superadmin"))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GroupMetadata {
    pub id: Jid,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub participants: Vec<GroupParticipant>,
}

/// Feature flags of a protocol implementation.
#[derive(Clone, Copy, Debug)]
pub struct ClientCapabilities {
    pub supports_buttons: bool,
    pub supports_lists: bool,
    pub supports_pairing_code: bool,
}
