use std::sync::Arc;

use wab_core::{services::BotServices, session::SessionManager};

/// Shared handler state; cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub services: Arc<BotServices>,
    pub sessions: SessionManager,
}

impl AppState {
    pub fn new(services: Arc<BotServices>, sessions: SessionManager) -> Self {
        Self { services, sessions }
    }
}
