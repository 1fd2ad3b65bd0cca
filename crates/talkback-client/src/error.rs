use thiserror::Error;

/// Why a session could not be established or had to end.
///
/// Every variant renders as a short message suitable for showing the user.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Microphone access was denied")]
    PermissionDenied,

    #[error("No microphone available: {0}")]
    MediaUnavailable(String),

    #[error("Could not obtain a session key: {0}")]
    CredentialError(String),

    #[error("Voice service rejected the connection: {0}")]
    SignalingError(String),

    #[error("Insufficient tokens (balance {balance}). Please buy a plan to continue.")]
    InsufficientBalance { balance: i64 },

    #[error("Tokens exhausted. Please buy a plan to continue.")]
    TokensExhausted,

    #[error("Token ledger unavailable: {0}")]
    LedgerUnavailable(String),

    #[error("No internet connection")]
    ConnectivityLost,

    #[error("Connection to the voice service was lost")]
    ConnectionLost,

    #[error("Could not reconnect after {attempts} attempts. Please check your internet connection.")]
    MaxRetriesExceeded { attempts: u32 },

    #[error("Voice service error: {0}")]
    ServerReportedError(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl SessionError {
    /// Whether a failed reconnection attempt with this error may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SessionError::CredentialError(_)
                | SessionError::SignalingError(_)
                | SessionError::ConnectionLost
                | SessionError::Transport(_)
        )
    }

    /// Errors caused by the ledger refusing further usage
    pub fn is_balance_related(&self) -> bool {
        matches!(
            self,
            SessionError::InsufficientBalance { .. }
                | SessionError::TokensExhausted
                | SessionError::LedgerUnavailable(_)
        )
    }
}

/// Microphone acquisition failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("permission denied")]
    PermissionDenied,

    #[error("{0}")]
    Unavailable(String),
}

impl From<MediaError> for SessionError {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::PermissionDenied => SessionError::PermissionDenied,
            MediaError::Unavailable(reason) => SessionError::MediaUnavailable(reason),
        }
    }
}

/// Peer connection, data channel and signaling failures
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("signaling failed with HTTP {status}: {body}")]
    Signaling { status: u16, body: String },

    #[error("signaling request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("webrtc: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("data channel is not open")]
    ChannelClosed,

    #[error("{0}")]
    Other(String),
}

impl From<TransportError> for SessionError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Signaling { .. } | TransportError::Http(_) => {
                SessionError::SignalingError(err.to_string())
            }
            other => SessionError::Transport(other.to_string()),
        }
    }
}
