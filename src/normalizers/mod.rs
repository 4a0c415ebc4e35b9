/*!
 * Redirect/webhook payload normalizers.
 *
 * Each provider adapter turns a raw redirect-return query or webhook body
 * into the canonical event shape, or `None` when the payload is not
 * recognized — irrelevant payloads are dropped silently, never treated as
 * errors. The flow core depends only on this capability, dispatched by
 * provider id through an immutable registry built at startup.
 */
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::models::{IntentStatus, ProviderId};

pub mod paypal;
pub mod stripe;

pub use paypal::PaypalNormalizer;
pub use stripe::StripeNormalizer;

/// Canonical shape of a redirect return.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RedirectReturn {
    pub provider: ProviderId,
    /// Correlation nonce matching the return to its attempt.
    pub reference_id: String,
    /// Status the provider claims in the return, if any. A hint only; the
    /// flow confirms via `get_status` before trusting it.
    pub status_hint: Option<IntentStatus>,
    pub raw: Value,
}

/// Canonical shape of a verified webhook delivery.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CanonicalWebhook {
    pub provider: ProviderId,
    pub reference_id: String,
    pub status: Option<IntentStatus>,
    pub event_type: String,
    pub raw: Value,
}

/// Provider-specific normalizer capability.
pub trait PayloadNormalizer: Send + Sync {
    fn provider(&self) -> &ProviderId;

    /// Normalize redirect-return query parameters, or `None` if the query
    /// does not belong to this provider.
    fn normalize_redirect(&self, params: &[(String, String)]) -> Option<RedirectReturn>;

    /// Normalize a verified webhook body, or `None` if unrecognized.
    fn normalize_webhook(
        &self,
        payload: &Value,
        headers: &HashMap<String, String>,
    ) -> Option<CanonicalWebhook>;
}

/// Canonical flattening for repeated query keys: last occurrence wins.
///
/// Every normalizer must apply this before inspecting well-known parameter
/// names, so duplicated keys behave identically across providers.
pub fn flatten_query(params: &[(String, String)]) -> HashMap<String, String> {
    let mut flat = HashMap::with_capacity(params.len());
    for (key, value) in params {
        flat.insert(key.clone(), value.clone());
    }
    flat
}

/// Immutable provider id → normalizer mapping, populated at startup.
#[derive(Clone, Default)]
pub struct NormalizerRegistry {
    map: HashMap<ProviderId, Arc<dyn PayloadNormalizer>>,
}

impl NormalizerRegistry {
    pub fn new(normalizers: Vec<Arc<dyn PayloadNormalizer>>) -> Self {
        let mut map = HashMap::with_capacity(normalizers.len());
        for normalizer in normalizers {
            map.insert(normalizer.provider().clone(), normalizer);
        }
        Self { map }
    }

    /// Registry with the built-in reference normalizers.
    pub fn with_defaults() -> Self {
        Self::new(vec![
            Arc::new(StripeNormalizer::new()),
            Arc::new(PaypalNormalizer::new()),
        ])
    }

    pub fn get(&self, provider: &ProviderId) -> Option<&Arc<dyn PayloadNormalizer>> {
        self.map.get(provider)
    }

    pub fn providers(&self) -> impl Iterator<Item = &ProviderId> {
        self.map.keys()
    }
}
