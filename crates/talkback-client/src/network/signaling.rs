//! SDP offer/answer exchange with the realtime provider

use crate::error::TransportError;

/// POST a raw SDP offer and return the provider's raw SDP answer
pub async fn post_sdp_offer(
    http: &reqwest::Client,
    provider_url: &str,
    model: &str,
    api_key: &str,
    offer_sdp: &str,
) -> Result<String, TransportError> {
    let url = format!("{}?model={}", provider_url, urlencoding::encode(model));

    let response = http
        .post(&url)
        .header("Authorization", format!("Bearer {}", api_key))
        .header("Content-Type", "application/sdp")
        .body(offer_sdp.to_string())
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        tracing::warn!("SDP exchange rejected with {}", status);
        return Err(TransportError::Signaling {
            status: status.as_u16(),
            body,
        });
    }

    Ok(response.text().await?)
}
