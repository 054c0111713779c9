use axum::extract::FromRef;
use std::sync::Arc;

use crate::config::Settings;
use crate::services::{ChatRelay, ConversationWindow, SessionRegistry};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<ChatRelay>,
    pub settings: Arc<Settings>,
}

impl AppState {
    pub fn new(relay: Arc<ChatRelay>, settings: Settings) -> Self {
        Self {
            relay,
            settings: Arc::new(settings),
        }
    }

    pub fn window(&self) -> &Arc<ConversationWindow> {
        self.relay.window()
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        self.relay.registry()
    }

    /// Boolean admin gate. An empty configured secret disables admin reads.
    pub fn is_admin(&self, secret: Option<&str>) -> bool {
        let expected = self.settings.admin.secret.as_str();
        !expected.is_empty() && secret == Some(expected)
    }
}

impl FromRef<AppState> for Arc<ChatRelay> {
    fn from_ref(state: &AppState) -> Self {
        state.relay.clone()
    }
}
