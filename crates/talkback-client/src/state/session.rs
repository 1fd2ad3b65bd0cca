use talkback_protocol::UserId;

use crate::error::SessionError;

/// Lifecycle of the realtime session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    /// Live and waiting for the next turn
    Connected,
    /// The provider heard the user start speaking
    Listening,
    /// A response is being generated
    Thinking,
    /// Assistant audio is playing
    Speaking,
    Reconnecting,
    Error,
}

impl ConnectionState {
    /// Any live sub-state
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connected
                | ConnectionState::Listening
                | ConnectionState::Thinking
                | ConnectionState::Speaking
        )
    }

    /// Connected or on the way there
    pub fn is_active(&self) -> bool {
        self.is_connected()
            || matches!(self, ConnectionState::Connecting | ConnectionState::Reconnecting)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Listening => "listening",
            ConnectionState::Thinking => "thinking",
            ConnectionState::Speaking => "speaking",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What subscribers see of the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: ConnectionState,
    pub user_id: Option<UserId>,
    pub selected_voice: Option<String>,
    /// Server-assigned voice session id
    pub session_id: Option<i64>,
    pub reconnect_attempts: u32,
    pub token_balance: i64,
    pub can_connect: bool,
    pub is_online: bool,
    pub error: Option<SessionError>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            state: ConnectionState::Idle,
            user_id: None,
            selected_voice: None,
            session_id: None,
            reconnect_attempts: 0,
            token_balance: 0,
            can_connect: false,
            is_online: true,
            error: None,
        }
    }
}
