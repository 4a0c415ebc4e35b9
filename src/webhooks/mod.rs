/*!
 * Webhook intake: authenticity verification followed by normalization.
 *
 * An unverified webhook must never reach a normalizer or the flow machine.
 * Verified-but-unrecognized payloads are dropped silently (logged, `None`).
 */
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::models::ProviderId;
use crate::normalizers::{CanonicalWebhook, NormalizerRegistry};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("webhook signature verification failed for provider {0}")]
    VerificationFailed(ProviderId),

    #[error("no normalizer registered for provider {0}")]
    UnknownProvider(ProviderId),
}

/// Authenticity check applied before any normalizer runs.
pub trait WebhookVerifier: Send + Sync {
    fn verify(
        &self,
        provider: &ProviderId,
        payload: &str,
        headers: &HashMap<String, String>,
    ) -> bool;
}

/// HMAC-SHA256 verifier over `"{timestamp}.{body}"`, hex-encoded signature.
///
/// Secrets are per provider; providers without a configured secret fail
/// verification outright.
pub struct HmacSha256Verifier {
    secrets: HashMap<ProviderId, String>,
    signature_header: String,
    timestamp_header: String,
}

impl HmacSha256Verifier {
    pub fn new(secrets: HashMap<ProviderId, String>) -> Self {
        Self {
            secrets,
            signature_header: "x-webhook-signature".to_string(),
            timestamp_header: "x-webhook-timestamp".to_string(),
        }
    }

    pub fn with_headers(
        mut self,
        signature_header: impl Into<String>,
        timestamp_header: impl Into<String>,
    ) -> Self {
        self.signature_header = signature_header.into();
        self.timestamp_header = timestamp_header.into();
        self
    }

    /// Signature for a payload, as the sending side would compute it.
    pub fn sign_payload(secret: &str, timestamp: &str, body: &str) -> String {
        let signed_payload = format!("{}.{}", timestamp, body);
        let mut mac =
            HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
        mac.update(signed_payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

impl WebhookVerifier for HmacSha256Verifier {
    fn verify(
        &self,
        provider: &ProviderId,
        payload: &str,
        headers: &HashMap<String, String>,
    ) -> bool {
        let Some(secret) = self.secrets.get(provider) else {
            warn!(%provider, "no webhook secret configured");
            return false;
        };
        let Some(signature) = headers.get(&self.signature_header) else {
            debug!(%provider, "missing signature header");
            return false;
        };
        let Some(timestamp) = headers.get(&self.timestamp_header) else {
            debug!(%provider, "missing timestamp header");
            return false;
        };
        let Ok(expected) = hex::decode(signature) else {
            debug!(%provider, "signature is not valid hex");
            return false;
        };

        let signed_payload = format!("{}.{}", timestamp, payload);
        let mut mac =
            HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
        mac.update(signed_payload.as_bytes());
        // Constant-time comparison via the MAC itself.
        mac.verify_slice(&expected).is_ok()
    }
}

/// Verify-then-normalize front door for webhook deliveries.
pub struct WebhookIntake {
    verifier: Arc<dyn WebhookVerifier>,
    registry: Arc<NormalizerRegistry>,
}

impl WebhookIntake {
    pub fn new(verifier: Arc<dyn WebhookVerifier>, registry: Arc<NormalizerRegistry>) -> Self {
        Self { verifier, registry }
    }

    /// Returns the canonical webhook event, `Ok(None)` for verified payloads
    /// the normalizer does not recognize, and an error for unverified
    /// deliveries or unknown providers.
    pub fn ingest(
        &self,
        provider: &ProviderId,
        body: &str,
        headers: &HashMap<String, String>,
    ) -> Result<Option<CanonicalWebhook>, WebhookError> {
        if !self.verifier.verify(provider, body, headers) {
            warn!(%provider, "rejecting unverified webhook");
            return Err(WebhookError::VerificationFailed(provider.clone()));
        }

        let normalizer = self
            .registry
            .get(provider)
            .ok_or_else(|| WebhookError::UnknownProvider(provider.clone()))?;

        let payload: serde_json::Value = match serde_json::from_str(body) {
            Ok(value) => value,
            Err(err) => {
                debug!(%provider, %err, "dropping unparseable webhook body");
                return Ok(None);
            }
        };

        Ok(normalizer.normalize_webhook(&payload, headers))
    }
}
