use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

use super::{flatten_query, CanonicalWebhook, PayloadNormalizer, RedirectReturn};
use crate::models::{IntentStatus, ProviderId};

/// Reference normalizer for PayPal-style payloads.
///
/// Redirect returns carry the order token as `token` (plus `PayerID` once
/// the buyer approved); webhooks are `event_type`/`resource` envelopes.
pub struct PaypalNormalizer {
    provider: ProviderId,
}

impl PaypalNormalizer {
    pub fn new() -> Self {
        Self {
            provider: ProviderId::new("paypal").expect("static provider id"),
        }
    }

    fn map_event_status(event_type: &str) -> Option<IntentStatus> {
        match event_type {
            "PAYMENT.CAPTURE.COMPLETED" | "CHECKOUT.ORDER.COMPLETED" => {
                Some(IntentStatus::Succeeded)
            }
            "PAYMENT.CAPTURE.DENIED" | "PAYMENT.CAPTURE.DECLINED" => Some(IntentStatus::Failed),
            "CHECKOUT.ORDER.APPROVED" => Some(IntentStatus::Processing),
            _ => None,
        }
    }
}

impl Default for PaypalNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl PayloadNormalizer for PaypalNormalizer {
    fn provider(&self) -> &ProviderId {
        &self.provider
    }

    fn normalize_redirect(&self, params: &[(String, String)]) -> Option<RedirectReturn> {
        let flat = flatten_query(params);
        let reference_id = flat.get("token")?.clone();
        // PayerID present means the buyer approved; absent means the buyer
        // came back without completing approval.
        let status_hint = if flat.contains_key("PayerID") {
            Some(IntentStatus::Processing)
        } else {
            None
        };
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
        let event_type = payload.get("event_type")?.as_str()?;
        let resource = payload.get("resource")?;
        let reference_id = resource
            .get("supplementary_data")
            .and_then(|s| s.get("related_ids"))
            .and_then(|r| r.get("order_id"))
            .or_else(|| resource.get("id"))
            .and_then(Value::as_str)?
            .to_string();
        if !event_type.starts_with("PAYMENT.") && !event_type.starts_with("CHECKOUT.") {
            debug!(event_type, "ignoring unrelated paypal event");
            return None;
        }
        Some(CanonicalWebhook {
            provider: self.provider.clone(),
            reference_id,
            status: Self::map_event_status(event_type),
            event_type: event_type.to_string(),
            raw: payload.clone(),
        })
    }
}
