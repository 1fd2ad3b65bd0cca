use reqwest::{Client, RequestBuilder};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use talkback_protocol::ApiEnvelope;
use thiserror::Error;

/// Backend request failure
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message} (HTTP {status})")]
    Status { status: u16, message: String },

    #[error("{0}")]
    Rejected(String),

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("response carried no data")]
    MissingData,
}

impl ApiError {
    /// The server-provided reason, without the HTTP decoration
    pub fn reason(&self) -> String {
        match self {
            ApiError::Status { message, .. } => message.clone(),
            ApiError::Rejected(message) => message.clone(),
            other => other.to_string(),
        }
    }

    /// The ledger refused a debit because the balance cannot cover it
    pub fn is_insufficient_tokens(&self) -> bool {
        match self {
            ApiError::Status { message, .. } | ApiError::Rejected(message) => {
                message.contains("Insufficient tokens")
            }
            _ => false,
        }
    }
}

pub async fn get<T: DeserializeOwned>(client: &Client, url: &str) -> Result<T, ApiError> {
    send(client.get(url)).await
}

pub async fn post<T: DeserializeOwned, B: Serialize>(
    client: &Client,
    url: &str,
    body: &B,
) -> Result<T, ApiError> {
    send(client.post(url).json(body)).await
}

pub async fn patch<T: DeserializeOwned, B: Serialize>(
    client: &Client,
    url: &str,
    body: &B,
) -> Result<T, ApiError> {
    send(client.patch(url).json(body)).await
}

async fn send<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, ApiError> {
    let response = request.send().await?;

    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        return Err(ApiError::Status {
            status: status.as_u16(),
            message: error_message(&text)
                .unwrap_or_else(|| format!("Request failed with status {}", status)),
        });
    }

    Ok(response.json().await?)
}

/// Pull the `error` (or `message`) field out of a failure body
fn error_message(body: &str) -> Option<String> {
    let envelope: ApiEnvelope<Value> = serde_json::from_str(body).ok()?;
    envelope.error.or(envelope.message).filter(|m| !m.is_empty())
}

/// Unwrap `{success, data}`, turning `success: false` into an error
pub fn into_data<T>(envelope: ApiEnvelope<T>) -> Result<T, ApiError> {
    if !envelope.success {
        return Err(rejection(envelope.error, envelope.message));
    }
    envelope.data.ok_or(ApiError::MissingData)
}

/// Check `success` on an envelope whose payload is not needed
pub fn ensure_success(envelope: ApiEnvelope<Value>) -> Result<(), ApiError> {
    if envelope.success {
        Ok(())
    } else {
        Err(rejection(envelope.error, envelope.message))
    }
}

fn rejection(error: Option<String>, message: Option<String>) -> ApiError {
    ApiError::Rejected(
        error
            .or(message)
            .unwrap_or_else(|| "request was not successful".to_string()),
    )
}
