use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::PaymentError;
use crate::models::{
    ConfirmPaymentRequest, FlowId, IntentStatus, PaymentIntent, ProviderId, StartPaymentRequest,
};
use crate::normalizers::{CanonicalWebhook, RedirectReturn};

/// Token tying an in-flight provider operation to the attempt that
/// dispatched it; results carrying a stale token are discarded.
pub type OpToken = Uuid;

/// Every input the flow machine consumes: user commands and asynchronous
/// system events, delivered through the same `send` entry point.
#[derive(Debug, Clone)]
pub enum FlowEvent {
    // Commands (user-originated)
    Start(StartPaymentRequest),
    Confirm(ConfirmPaymentRequest),
    Cancel { reason: Option<String> },
    Refresh,
    Reset,

    // System events (external-originated, may arrive at any time)
    ProviderUpdate {
        token: OpToken,
        provider: ProviderId,
        outcome: Result<PaymentIntent, PaymentError>,
    },
    WebhookReceived(CanonicalWebhook),
    ValidationFailed(PaymentError),
    StatusConfirmed {
        token: OpToken,
        provider: ProviderId,
        outcome: Result<PaymentIntent, PaymentError>,
    },
    RedirectReturned(RedirectReturn),
    ExternalStatusUpdated {
        reference_id: String,
        status: Option<IntentStatus>,
    },
    FallbackRequested(FallbackUserResponse),
    FallbackExecute {
        target: ProviderId,
        request: StartPaymentRequest,
    },
    FallbackAbort,
}

impl FlowEvent {
    /// Stable label used for snapshots and telemetry.
    pub fn kind(&self) -> &'static str {
        match self {
            FlowEvent::Start(_) => "start",
            FlowEvent::Confirm(_) => "confirm",
            FlowEvent::Cancel { .. } => "cancel",
            FlowEvent::Refresh => "refresh",
            FlowEvent::Reset => "reset",
            FlowEvent::ProviderUpdate { .. } => "provider_update",
            FlowEvent::WebhookReceived(_) => "webhook_received",
            FlowEvent::ValidationFailed(_) => "validation_failed",
            FlowEvent::StatusConfirmed { .. } => "status_confirmed",
            FlowEvent::RedirectReturned(_) => "redirect_returned",
            FlowEvent::ExternalStatusUpdated { .. } => "external_status_updated",
            FlowEvent::FallbackRequested(_) => "fallback_requested",
            FlowEvent::FallbackExecute { .. } => "fallback_execute",
            FlowEvent::FallbackAbort => "fallback_abort",
        }
    }

    pub fn is_command(&self) -> bool {
        matches!(
            self,
            FlowEvent::Start(_)
                | FlowEvent::Confirm(_)
                | FlowEvent::Cancel { .. }
                | FlowEvent::Refresh
                | FlowEvent::Reset
        )
    }
}

/// A time-boxed offer to retry the payment on an alternate provider.
///
/// Exactly one offer may be pending at a time; a new failure invalidates and
/// replaces the previous pending offer under a fresh `event_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackAvailableEvent {
    pub event_id: Uuid,
    pub failed_provider: ProviderId,
    pub error: PaymentError,
    pub alternative_providers: Vec<ProviderId>,
    pub original_request: StartPaymentRequest,
    pub timestamp: DateTime<Utc>,
}

/// Caller's answer to a fallback offer. Honored only while the offer it
/// names is still the pending one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackUserResponse {
    pub event_id: Uuid,
    pub accepted: bool,
    pub selected_provider: Option<ProviderId>,
    pub timestamp: DateTime<Utc>,
}

/// Kinds of telemetry records emitted by the flow and its pipeline.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TelemetryKind {
    CommandSent,
    StateChanged,
    EventDropped,
    SnapshotPersisted,
    FallbackOffered,
    FallbackExecuted,
    FallbackExpired,
}

/// One telemetry record. Sinks must never block or fail the flow; errors
/// from a sink are swallowed by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub kind: TelemetryKind,
    pub at_ms: i64,
    pub flow_id: FlowId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
}

impl TelemetryEvent {
    pub fn now(kind: TelemetryKind, flow_id: FlowId) -> Self {
        Self {
            kind,
            at_ms: Utc::now().timestamp_millis(),
            flow_id,
            provider: None,
            from_state: None,
            to_state: None,
            trigger: None,
        }
    }

    pub fn with_trigger(mut self, trigger: impl Into<String>) -> Self {
        self.trigger = Some(trigger.into());
        self
    }

    pub fn with_provider(mut self, provider: Option<ProviderId>) -> Self {
        self.provider = provider;
        self
    }

    pub fn with_transition(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.from_state = Some(from.into());
        self.to_state = Some(to.into());
        self
    }
}
