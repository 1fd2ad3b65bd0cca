pub mod api;
pub mod signaling;

pub use api::ApiError;

use async_trait::async_trait;
use std::time::Duration;
use serde_json::Value;
use talkback_protocol::{
    ApiEnvelope, CreateVoiceSessionRequest, CredentialResponse, DeductTokensRequest,
    HealthStatus, SaveMessageRequest, SelectPromptRequest, SelectVoiceRequest, TokenBalanceData,
    TokenDeductData, UpdateModelRequest, UserData, UserId, UserProfile, VoiceSessionData,
};

/// Backend REST API used by the session
#[async_trait]
pub trait Backend: Send + Sync {
    async fn token_balance(&self, user_id: UserId) -> Result<i64, ApiError>;

    async fn deduct_tokens(&self, request: &DeductTokensRequest) -> Result<TokenDeductData, ApiError>;

    /// Ephemeral bearer key for the realtime provider
    async fn issue_credential(&self, user_id: Option<UserId>) -> Result<String, ApiError>;

    async fn get_user(&self, user_id: UserId) -> Result<UserProfile, ApiError>;

    async fn save_message(&self, request: &SaveMessageRequest) -> Result<(), ApiError>;

    /// Register a voice session, returning the server-assigned id
    async fn create_voice_session(&self, user_id: UserId) -> Result<i64, ApiError>;

    async fn update_user_model(&self, user_id: UserId, model: &str) -> Result<(), ApiError>;

    async fn update_user_voice(&self, user_id: UserId, voice: &str) -> Result<(), ApiError>;

    async fn select_prompt(&self, user_id: UserId, prompt_id: i64) -> Result<(), ApiError>;

    async fn health(&self) -> Result<HealthStatus, ApiError>;
}

/// Per-request timeout used when none is configured
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub const USER_AGENT: &str = concat!("talkback/", env!("CARGO_PKG_VERSION"));

/// `Backend` over HTTP
#[derive(Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
}

impl BackendClient {
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        Self::with_timeout(base_url, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Client whose requests give up after `timeout`.
    ///
    /// Every ledger call is awaited on the session's event path, so an
    /// unbounded request would stall the session behind it.
    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self::with_client(http, base_url))
    }

    pub fn with_client(http: reqwest::Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl Backend for BackendClient {
    async fn token_balance(&self, user_id: UserId) -> Result<i64, ApiError> {
        let envelope: ApiEnvelope<TokenBalanceData> =
            api::get(&self.http, &self.url(&format!("/tokens?user_id={}", user_id))).await?;
        Ok(api::into_data(envelope)?.token_balance)
    }

    async fn deduct_tokens(&self, request: &DeductTokensRequest) -> Result<TokenDeductData, ApiError> {
        let envelope: ApiEnvelope<TokenDeductData> =
            api::patch(&self.http, &self.url("/tokens"), request).await?;
        api::into_data(envelope)
    }

    async fn issue_credential(&self, user_id: Option<UserId>) -> Result<String, ApiError> {
        let url = match user_id {
            Some(id) => self.url(&format!("/token?user_id={}", id)),
            None => self.url("/token"),
        };
        let response: CredentialResponse = api::get(&self.http, &url).await?;
        response.into_key().ok_or(ApiError::MissingData)
    }

    async fn get_user(&self, user_id: UserId) -> Result<UserProfile, ApiError> {
        let envelope: ApiEnvelope<UserData> =
            api::get(&self.http, &self.url(&format!("/users?user_id={}", user_id))).await?;
        Ok(api::into_data(envelope)?.user)
    }

    async fn save_message(&self, request: &SaveMessageRequest) -> Result<(), ApiError> {
        let envelope: ApiEnvelope<Value> =
            api::post(&self.http, &self.url("/conversation"), request).await?;
        api::ensure_success(envelope)
    }

    async fn create_voice_session(&self, user_id: UserId) -> Result<i64, ApiError> {
        let body = CreateVoiceSessionRequest {
            user_id: Some(user_id),
            ..Default::default()
        };
        let envelope: ApiEnvelope<VoiceSessionData> =
            api::post(&self.http, &self.url("/voice-sessions"), &body).await?;
        Ok(api::into_data(envelope)?.session_id)
    }

    async fn update_user_model(&self, user_id: UserId, model: &str) -> Result<(), ApiError> {
        let body = UpdateModelRequest {
            user_id,
            selected_model: model.to_string(),
        };
        let envelope: ApiEnvelope<Value> = api::patch(&self.http, &self.url("/users"), &body).await?;
        api::ensure_success(envelope)
    }

    async fn update_user_voice(&self, user_id: UserId, voice: &str) -> Result<(), ApiError> {
        let body = SelectVoiceRequest {
            user_id,
            voice: voice.to_string(),
        };
        let envelope: ApiEnvelope<Value> =
            api::post(&self.http, &self.url("/user-voice"), &body).await?;
        api::ensure_success(envelope)
    }

    async fn select_prompt(&self, user_id: UserId, prompt_id: i64) -> Result<(), ApiError> {
        let body = SelectPromptRequest { user_id, prompt_id };
        let envelope: ApiEnvelope<Value> =
            api::post(&self.http, &self.url("/user-prompt"), &body).await?;
        api::ensure_success(envelope)
    }

    async fn health(&self) -> Result<HealthStatus, ApiError> {
        api::get(&self.http, &self.url("/health")).await
    }
}
