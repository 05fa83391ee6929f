//! Delivery attempt executor: signed HTTP POSTs to webhook endpoints.

use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::DeliveryError;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the payload signature, GitHub-style: `sha256=<hex>`.
pub const SIGNATURE_HEADER: &str = "x-roomcast-signature";

/// Outcome of one delivery attempt that obtained an HTTP response.
///
/// Any status code counts as a response here; the dispatcher decides what
/// is success and what retries.
#[derive(Debug, Clone)]
pub struct DeliveryResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body (untruncated; the dispatcher applies the cap).
    pub body: String,
}

impl DeliveryResponse {
    /// Whether the status code is in the 2xx range.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Performs one webhook delivery attempt.
///
/// The dispatcher owns retrying and classification; implementations make
/// exactly one POST and report what happened. The crate ships the
/// reqwest-backed [`HttpSender`]; tests substitute scripted senders.
#[async_trait]
pub trait DeliverySender: Send + Sync {
    /// POSTs the body to the URL with the given signature header.
    ///
    /// Returns `Ok` for any HTTP response, `Err` when no response was
    /// obtained (network failure, timeout, unusable request).
    async fn send(
        &self,
        url: &str,
        body: &str,
        signature: &str,
        timeout: Duration,
    ) -> Result<DeliveryResponse, DeliveryError>;
}

/// The production [`DeliverySender`] backed by a shared reqwest client.
pub struct HttpSender {
    client: reqwest::Client,
}

impl HttpSender {
    /// Creates a sender with a default client.
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Creates a sender using the given client (custom TLS, proxies, ...).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for HttpSender {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeliverySender for HttpSender {
    async fn send(
        &self,
        url: &str,
        body: &str,
        signature: &str,
        timeout: Duration,
    ) -> Result<DeliveryResponse, DeliveryError> {
        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, signature)
            .timeout(timeout)
            .body(body.to_string())
            .send()
            .await
            .map_err(|e| {
                if e.is_builder() {
                    DeliveryError::Request {
                        reason: e.to_string(),
                    }
                } else {
                    DeliveryError::network(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        // A failed body read still counts as a response; keep the status.
        let body = response.text().await.unwrap_or_default();
        Ok(DeliveryResponse { status, body })
    }
}

/// Signs a payload with the endpoint secret.
///
/// Returns the value for the [`SIGNATURE_HEADER`] header:
/// `sha256=<hex of HMAC-SHA256(secret, body)>`.
pub fn sign_payload(secret: &str, body: &[u8]) -> Result<String, DeliveryError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|e| DeliveryError::Request {
            reason: format!("unusable signing secret: {e}"),
        })?;
    mac.update(body);
    let digest = mac.finalize().into_bytes();
    Ok(format!("sha256={}", hex::encode(digest)))
}

/// Verifies a signature header against a body and secret.
///
/// Intended for receiver-side tests and documentation; the engine itself
/// only signs.
pub fn verify_signature(secret: &str, body: &[u8], signature_header: &str) -> bool {
    match sign_payload(secret, body) {
        Ok(expected) => expected == signature_header,
        Err(_) => false,
    }
}
