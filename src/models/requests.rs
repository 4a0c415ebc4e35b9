use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::Validate;

use super::ids::{IntentId, OrderId, ProviderId};
use super::money::Money;

/// Input for `START`: one payment attempt against one provider.
///
/// The fallback orchestrator re-issues this request verbatim with only the
/// provider swapped, so everything needed to retry lives here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct StartPaymentRequest {
    pub provider: ProviderId,
    pub order_id: OrderId,
    pub amount: Money,
    /// Tokenized payment method reference, if collected up front.
    #[validate(length(min = 1))]
    pub method_token: Option<String>,
    /// Where redirect-style providers send the customer back to.
    #[validate(length(min = 1))]
    pub return_url: Option<String>,
    /// Explicit correlation nonce. When absent the provider's reference id
    /// becomes the nonce once the intent is created.
    #[validate(length(min = 1))]
    pub nonce: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl StartPaymentRequest {
    /// The same attempt retargeted at another provider, for fallback.
    pub fn retargeted(&self, provider: ProviderId) -> Self {
        Self {
            provider,
            ..self.clone()
        }
    }
}

/// Input for `CONFIRM` after a `client_confirm` or manual step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ConfirmPaymentRequest {
    pub intent_id: IntentId,
    #[validate(length(min = 1))]
    pub token: Option<String>,
}

/// Input for `CANCEL`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelPaymentRequest {
    pub intent_id: IntentId,
    pub reason: Option<String>,
}

/// Post-authorization capture request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureRequest {
    pub intent_id: IntentId,
    /// Partial capture amount; full authorized amount when absent.
    pub amount: Option<Money>,
}

/// Post-capture refund request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefundRequest {
    pub intent_id: IntentId,
    pub amount: Option<Money>,
    pub reason: Option<String>,
}

/// Void of an uncaptured authorization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoidRequest {
    pub intent_id: IntentId,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum GatewayStatus {
    Succeeded,
    Pending,
    Failed,
}

/// Outcome of a capture/refund/void gateway call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayResult {
    pub status: GatewayStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
}
