use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::errors::PaymentError;
use crate::events::OpToken;
use crate::models::{
    CancelPaymentRequest, ConfirmPaymentRequest, FlowId, PaymentIntent, ProviderId,
    StartPaymentRequest,
};

/// Working memory of the current payment attempt.
///
/// Created on `START`, replaced wholesale on `RESET`, partially updated by
/// every transition. Serializable so the snapshot store can persist and
/// restore it keyed by `flow_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentFlowContext {
    pub flow_id: FlowId,
    /// Provider targeted by the most recent operation.
    pub provider: Option<ProviderId>,
    /// Last intent returned by any provider call; superseded, never mutated.
    pub intent: Option<PaymentIntent>,
    pub start_request: Option<StartPaymentRequest>,
    pub confirm_request: Option<ConfirmPaymentRequest>,
    pub cancel_request: Option<CancelPaymentRequest>,
    pub last_error: Option<PaymentError>,
    /// Provider whose failure put the flow into fallback.
    pub fallback_from: Option<ProviderId>,
    pub fallback_candidates: Vec<ProviderId>,
    pub fallback_event_id: Option<Uuid>,
    /// Correlation nonce for redirect/webhook deliveries of this attempt.
    pub active_nonce: Option<String>,
    /// Nonces already reconciled; repeat deliveries are no-ops.
    pub reconciled_nonces: BTreeSet<String>,
    /// Token of the in-flight provider operation, if any. Results carrying
    /// another token are stale and must be discarded.
    #[serde(skip)]
    pub op_token: Option<OpToken>,
}

impl PaymentFlowContext {
    pub fn new(flow_id: FlowId) -> Self {
        Self {
            flow_id,
            provider: None,
            intent: None,
            start_request: None,
            confirm_request: None,
            cancel_request: None,
            last_error: None,
            fallback_from: None,
            fallback_candidates: Vec::new(),
            fallback_event_id: None,
            active_nonce: None,
            reconciled_nonces: BTreeSet::new(),
            op_token: None,
        }
    }

    /// Total reset: everything back to the initial context, same flow id.
    pub fn reset(&mut self) {
        *self = Self::new(self.flow_id);
    }

    /// Prepare the context for a fresh attempt (first start or fallback
    /// re-entry), keeping only the fields that survive across attempts.
    pub fn begin_attempt(&mut self, request: StartPaymentRequest) -> OpToken {
        let token = Uuid::new_v4();
        self.provider = Some(request.provider.clone());
        self.active_nonce = request.nonce.clone();
        self.start_request = Some(request);
        self.confirm_request = None;
        self.cancel_request = None;
        self.intent = None;
        self.last_error = None;
        self.op_token = Some(token);
        token
    }

    /// Issue a token for a follow-up operation on the current attempt.
    pub fn begin_operation(&mut self) -> OpToken {
        let token = Uuid::new_v4();
        self.op_token = Some(token);
        token
    }

    /// Adopt a provider-issued intent, deriving the correlation nonce when
    /// no explicit one was supplied.
    pub fn adopt_intent(&mut self, intent: PaymentIntent) {
        if self.active_nonce.is_none() {
            self.active_nonce = Some(intent.reference_id().to_string());
        }
        self.provider = Some(intent.provider.clone());
        self.intent = Some(intent);
    }

    /// Whether a delivery with this nonce belongs to the current attempt and
    /// has not been reconciled yet.
    pub fn accepts_nonce(&self, nonce: &str) -> bool {
        if self.reconciled_nonces.contains(nonce) {
            return false;
        }
        self.active_nonce.as_deref() == Some(nonce)
    }

    /// Mark the active nonce reconciled so repeat deliveries become no-ops.
    pub fn mark_reconciled(&mut self) {
        if let Some(nonce) = self.active_nonce.clone() {
            self.reconciled_nonces.insert(nonce);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{IntentId, IntentStatus, Money, OrderId};
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;

    fn request(nonce: Option<&str>) -> StartPaymentRequest {
        StartPaymentRequest {
            provider: ProviderId::new("stripe").unwrap(),
            order_id: OrderId::new("ord_1").unwrap(),
            amount: Money::new(dec!(12.00), "USD").unwrap(),
            method_token: None,
            return_url: None,
            nonce: nonce.map(str::to_string),
            metadata: None,
        }
    }

    fn intent(id: &str) -> PaymentIntent {
        PaymentIntent {
            id: IntentId::new(id).unwrap(),
            provider: ProviderId::new("stripe").unwrap(),
            status: IntentStatus::RequiresAction,
            amount: Money::new(dec!(12.00), "USD").unwrap(),
            next_action: None,
            provider_refs: BTreeMap::new(),
            raw: None,
        }
    }

    #[test]
    fn reset_restores_the_initial_context() {
        let flow_id = FlowId::generate();
        let initial = PaymentFlowContext::new(flow_id);
        let mut ctx = initial.clone();
        ctx.begin_attempt(request(Some("n1")));
        ctx.adopt_intent(intent("pi_1"));
        ctx.mark_reconciled();
        ctx.reset();
        assert_eq!(ctx, initial);
    }

    #[test]
    fn nonce_defaults_to_intent_reference() {
        let mut ctx = PaymentFlowContext::new(FlowId::generate());
        ctx.begin_attempt(request(None));
        ctx.adopt_intent(intent("pi_7"));
        assert!(ctx.accepts_nonce("pi_7"));
        assert!(!ctx.accepts_nonce("pi_other"));
    }

    #[test]
    fn explicit_nonce_wins_over_intent_reference() {
        let mut ctx = PaymentFlowContext::new(FlowId::generate());
        ctx.begin_attempt(request(Some("custom")));
        ctx.adopt_intent(intent("pi_7"));
        assert!(ctx.accepts_nonce("custom"));
        assert!(!ctx.accepts_nonce("pi_7"));
    }

    #[test]
    fn reconciled_nonce_is_no_longer_accepted() {
        let mut ctx = PaymentFlowContext::new(FlowId::generate());
        ctx.begin_attempt(request(Some("n1")));
        assert!(ctx.accepts_nonce("n1"));
        ctx.mark_reconciled();
        assert!(!ctx.accepts_nonce("n1"));
    }
}
