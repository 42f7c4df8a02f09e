//! Per-phone session lifecycle.
//!
//! `Uninitialized -> Connecting -> Open -> (ClosedReconnect | ClosedLoggedOut)`.
//! `ClosedReconnect` loops back to `Connecting` after a fixed delay;
//! `ClosedLoggedOut` is terminal and tears everything down.

mod manager;
mod registry;

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;

use crate::{
    messaging::types::{CallOffer, IncomingMessage},
    settings::UserSettings,
};

pub use manager::{format_pairing_code, PairingCode, ReloadReport, SessionManager};
pub use registry::{SessionHandle, SessionRegistry};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Uninitialized,
    Connecting,
    Open,
    ClosedReconnect,
    ClosedLoggedOut,
}

impl SessionState {
    /// States that own a running driver task.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            SessionState::Connecting | SessionState::Open | SessionState::ClosedReconnect
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Connecting => "connecting",
            SessionState::Open => "open",
            SessionState::ClosedReconnect => "closed_reconnect",
            SessionState::ClosedLoggedOut => "closed_logged_out",
        };
        f.write_str(s)
    }
}

/// Where a session's auth state came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOrigin {
    /// Paired on this host; auth lives under the sessions directory.
    Fresh,
    /// Downloaded from a backup into the restored-sessions directory.
    Restored,
}

impl fmt::Display for SessionOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionOrigin::Fresh => f.write_str("fresh"),
            SessionOrigin::Restored => f.write_str("restored"),
        }
    }
}

/// Receives the application-level events of every session.
///
/// Calls for one session are made sequentially from that session's driver task.
#[async_trait]
pub trait SessionEventHandler: Send + Sync {
    /// After the post-connect bookkeeping; `first_open` is false on reconnects.
    async fn on_connected(&self, session: &SessionHandle, settings: &UserSettings, first_open: bool);

    async fn on_message(&self, session: &SessionHandle, message: IncomingMessage);

    async fn on_calls(&self, session: &SessionHandle, offers: Vec<CallOffer>);
}
