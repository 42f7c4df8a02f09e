//! JSON bodies exchanged with the bridge process.

use serde::{Deserialize, Serialize};

use wab_core::{
    domain::{Jid, MessageKey},
    messaging::types::{
        Button, ClientCapabilities, ListSection, OutgoingMessage, ParticipantAction, Presence,
    },
};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ConnectResponse {
    #[serde(default)]
    pub capabilities: WireCapabilities,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireCapabilities {
    #[serde(default)]
    pub buttons: bool,
    #[serde(default)]
    pub lists: bool,
    #[serde(default = "yes")]
    pub pairing_code: bool,
}

fn yes() -> bool {
    true
}

impl Default for WireCapabilities {
    fn default() -> Self {
        Self {
            buttons: false,
            lists: false,
            pairing_code: true,
        }
    }
}

impl From<WireCapabilities> for ClientCapabilities {
    fn from(c: WireCapabilities) -> Self {
        ClientCapabilities {
            supports_buttons: c.buttons,
            supports_lists: c.lists,
            supports_pairing_code: c.pairing_code,
        }
    }
}

/// Every outgoing message except documents, which go out as multipart.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub(crate) enum WireMessage<'a> {
    Text {
        text: &'a str,
        #[serde(skip_serializing_if = "<[Jid]>::is_empty")]
        mentions: &'a [Jid],
        #[serde(skip_serializing_if = "Option::is_none")]
        quoted: Option<&'a MessageKey>,
    },
    Image {
        url: &'a str,
        caption: Option<&'a str>,
    },
    Video {
        url: &'a str,
        caption: Option<&'a str>,
    },
    Audio {
        url: &'a str,
        mimetype: &'a str,
    },
    Buttons {
        text: &'a str,
        footer: Option<&'a str>,
        buttons: &'a [Button],
    },
    List {
        title: &'a str,
        text: &'a str,
        footer: Option<&'a str>,
        button_text: &'a str,
        sections: &'a [ListSection],
    },
    Contact {
        display_name: &'a str,
        vcard: &'a str,
    },
    Reaction {
        key: &'a MessageKey,
        emoji: &'a str,
    },
    Delete {
        key: &'a MessageKey,
    },
}

impl<'a> WireMessage<'a> {
    /// `None` for documents.
    pub fn from_message(m: &'a OutgoingMessage) -> Option<Self> {
        Some(match m {
            OutgoingMessage::Text {
                text,
                mentions,
                quoted,
            } => WireMessage::Text {
                text,
                mentions,
                quoted: quoted.as_ref(),
            },
            OutgoingMessage::Image { url, caption } => WireMessage::Image {
                url,
                caption: caption.as_deref(),
            },
            OutgoingMessage::Video { url, caption } => WireMessage::Video {
                url,
                caption: caption.as_deref(),
            },
            OutgoingMessage::Audio { url, mimetype } => WireMessage::Audio { url, mimetype },
            OutgoingMessage::Buttons {
                text,
                footer,
                buttons,
            } => WireMessage::Buttons {
                text,
                footer: footer.as_deref(),
                buttons,
            },
            OutgoingMessage::List {
                title,
                text,
                footer,
                button_text,
                sections,
            } => WireMessage::List {
                title,
                text,
                footer: footer.as_deref(),
                button_text,
                sections,
            },
            OutgoingMessage::Contact {
                display_name,
                vcard,
            } => WireMessage::Contact {
                display_name,
                vcard,
            },
            OutgoingMessage::Reaction { key, emoji } => WireMessage::Reaction { key, emoji },
            OutgoingMessage::Delete { key } => WireMessage::Delete { key },
            OutgoingMessage::Document(_) => return None,
        })
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct SendRequest<'a> {
    pub to: &'a Jid,
    pub message: WireMessage<'a>,
}

/// Metadata part of a multipart document upload.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DocumentMeta<'a> {
    pub to: &'a Jid,
    pub file_name: &'a str,
    pub mimetype: &'a str,
    pub caption: Option<&'a str>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct SendResponse {
    #[serde(default)]
    pub key: Option<MessageKey>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ReadRequest<'a> {
    pub keys: &'a [MessageKey],
}

#[derive(Debug, Serialize)]
pub(crate) struct PresenceRequest<'a> {
    pub presence: Presence,
    pub to: Option<&'a Jid>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RejectCallRequest<'a> {
    pub call_id: &'a str,
    pub from: &'a Jid,
}

#[derive(Debug, Serialize)]
pub(crate) struct ParticipantsRequest<'a> {
    pub group: &'a Jid,
    pub participants: &'a [Jid],
    pub action: ParticipantAction,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PairingRequest<'a> {
    pub phone_number: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_code: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PairingResponse {
    pub code: String,
}
