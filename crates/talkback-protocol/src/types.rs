use serde::{Deserialize, Serialize};

/// Backend user identifier
pub type UserId = i64;

/// Standard response envelope returned by every backend endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct ApiEnvelope<T> {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> ApiEnvelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            message: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            message: None,
        }
    }
}

/// Token usage reported by the provider on `response.done`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub total_tokens: i64,
    #[serde(default)]
    pub input_tokens: i64,
    #[serde(default)]
    pub output_tokens: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_token_details: Option<TokenDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_token_details: Option<TokenDetails>,
}

impl TokenUsage {
    /// Usage record for settling a leftover balance in one charge
    pub fn sweep(balance: i64) -> Self {
        Self {
            total_tokens: balance,
            input_tokens: balance,
            output_tokens: 0,
            input_token_details: None,
            output_token_details: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenDetails {
    #[serde(default)]
    pub text_tokens: i64,
    #[serde(default)]
    pub audio_tokens: i64,
    #[serde(default)]
    pub image_tokens: i64,
    #[serde(default)]
    pub cached_tokens: i64,
}

/// `GET /tokens` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBalanceData {
    pub token_balance: i64,
}

/// `PATCH /tokens` body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeductTokensRequest {
    pub user_id: UserId,
    pub session_id: String,
    pub usage: TokenUsage,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub check_only: bool,
}

/// `PATCH /tokens` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenDeductData {
    pub new_balance: i64,
    #[serde(default)]
    pub tokens_used: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSecret {
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<ClientSecret>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// `GET /token` response.
///
/// The backend relays the provider's session object, sometimes wrapped in the
/// standard envelope and sometimes bare, so every known location of the key
/// is accepted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<CredentialBody>,
    #[serde(flatten)]
    pub bare: CredentialBody,
}

impl CredentialResponse {
    /// Extract the ephemeral bearer key, if the response carried one
    pub fn into_key(self) -> Option<String> {
        let CredentialResponse { data, bare } = self;
        data.into_iter()
            .chain(std::iter::once(bare))
            .find_map(|body| body.client_secret.map(|secret| secret.value).or(body.value))
            .filter(|key| !key.is_empty())
    }
}

/// User profile as stored by the backend
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    #[serde(default)]
    pub telegram_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub is_premium: bool,
    #[serde(default)]
    pub token_balance: i64,
    #[serde(default)]
    pub selected_model: Option<String>,
    #[serde(default)]
    pub selected_voice: Option<String>,
    #[serde(default)]
    pub selected_prompt_id: Option<i64>,
}

/// `GET /users` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserData {
    pub user: UserProfile,
}

/// Author of a conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

/// `POST /conversation` body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveMessageRequest {
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<i64>,
    pub message_type: MessageRole,
    pub content: String,
    #[serde(default)]
    pub audio_duration_seconds: u32,
}

/// `PATCH /users` body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateModelRequest {
    pub user_id: UserId,
    pub selected_model: String,
}

/// `POST /user-voice` body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectVoiceRequest {
    pub user_id: UserId,
    pub voice: String,
}

/// `POST /user-prompt` body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectPromptRequest {
    pub user_id: UserId,
    pub prompt_id: i64,
}

/// `POST /voice-sessions` body
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateVoiceSessionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub words_spoken: i64,
    #[serde(default)]
    pub ai_responses: i64,
}

/// `POST /voice-sessions` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceSessionData {
    pub session_id: i64,
}

/// `GET /health` response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    #[serde(default)]
    pub service: Option<String>,
}
