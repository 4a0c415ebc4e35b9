use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use tracing::debug;

use super::{flatten_query, CanonicalWebhook, PayloadNormalizer, RedirectReturn};
use crate::models::{IntentStatus, ProviderId};

/// Reference normalizer for Stripe-style payloads.
///
/// Redirect returns carry `payment_intent` and `redirect_status` query
/// parameters; webhooks are `payment_intent.*` events with the intent object
/// under `data.object`.
pub struct StripeNormalizer {
    provider: ProviderId,
}

impl StripeNormalizer {
    pub fn new() -> Self {
        Self {
            // Literal is a valid provider id.
            provider: ProviderId::new("stripe").expect("static provider id"),
        }
    }

    fn map_redirect_status(status: &str) -> Option<IntentStatus> {
        match status {
            "succeeded" => Some(IntentStatus::Succeeded),
            "failed" => Some(IntentStatus::Failed),
            "pending" | "processing" => Some(IntentStatus::Processing),
            "requires_payment_method" => Some(IntentStatus::RequiresPaymentMethod),
            _ => None,
        }
    }
}

impl Default for StripeNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl PayloadNormalizer for StripeNormalizer {
    fn provider(&self) -> &ProviderId {
        &self.provider
    }

    fn normalize_redirect(&self, params: &[(String, String)]) -> Option<RedirectReturn> {
        let flat = flatten_query(params);
        let reference_id = flat.get("payment_intent")?.clone();
        let status_hint = flat
            .get("redirect_status")
            .and_then(|s| Self::map_redirect_status(s));
        Some(RedirectReturn {
            provider: self.provider.clone(),
            reference_id,
            status_hint,
            raw: serde_json::to_value(&flat).unwrap_or(Value::Null),
        })
    }

    fn normalize_webhook(
        &self,
        payload: &Value,
        _headers: &HashMap<String, String>,
    ) -> Option<CanonicalWebhook> {
        let event_type = payload.get("type")?.as_str()?;
        if !event_type.starts_with("payment_intent.") {
            debug!(event_type, "ignoring non payment_intent stripe event");
            return None;
        }
        let object = payload.get("data")?.get("object")?;
        let reference_id = object.get("id")?.as_str()?.to_string();
        let status = object
            .get("status")
            .and_then(Value::as_str)
            .and_then(|s| IntentStatus::from_str(s).ok());
        Some(CanonicalWebhook {
            provider: self.provider.clone(),
            reference_id,
            status,
            event_type: event_type.to_string(),
            raw: payload.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn redirect_return_extracts_payment_intent() {
        let normalizer = StripeNormalizer::new();
        let ret = normalizer
            .normalize_redirect(&params(&[("payment_intent", "pi_1")]))
            .unwrap();
        assert_eq!(ret.provider.as_str(), "stripe");
        assert_eq!(ret.reference_id, "pi_1");
        assert_eq!(ret.status_hint, None);
    }

    #[test]
    fn redirect_status_maps_to_hint() {
        let normalizer = StripeNormalizer::new();
        let ret = normalizer
            .normalize_redirect(&params(&[
                ("payment_intent", "pi_2"),
                ("redirect_status", "succeeded"),
            ]))
            .unwrap();
        assert_eq!(ret.status_hint, Some(IntentStatus::Succeeded));
    }

    #[test]
    fn redirect_without_payment_intent_is_irrelevant() {
        let normalizer = StripeNormalizer::new();
        assert!(normalizer
            .normalize_redirect(&params(&[("session_id", "cs_1")]))
            .is_none());
    }

    #[test]
    fn webhook_normalizes_payment_intent_events() {
        let normalizer = StripeNormalizer::new();
        let payload = json!({
            "type": "payment_intent.succeeded",
            "data": { "object": { "id": "pi_3", "status": "succeeded" } }
        });
        let hook = normalizer
            .normalize_webhook(&payload, &HashMap::new())
            .unwrap();
        assert_eq!(hook.reference_id, "pi_3");
        assert_eq!(hook.status, Some(IntentStatus::Succeeded));
        assert_eq!(hook.event_type, "payment_intent.succeeded");
    }

    #[test]
    fn webhook_ignores_unrelated_events() {
        let normalizer = StripeNormalizer::new();
        let payload = json!({ "type": "invoice.paid", "data": { "object": { "id": "in_1" } } });
        assert!(normalizer
            .normalize_webhook(&payload, &HashMap::new())
            .is_none());
    }
}
