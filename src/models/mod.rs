// Payment data model: validated value objects and the provider-facing types.
pub mod ids;
pub mod intent;
pub mod money;
pub mod requests;

// Re-export common types for convenience
pub use ids::{FlowId, IntentId, OrderId, ProviderId};
pub use intent::{ActionKind, IntentStatus, NextAction, PaymentIntent};
pub use money::{CurrencyCode, Money};
pub use requests::{
    CancelPaymentRequest, CaptureRequest, ConfirmPaymentRequest, GatewayResult, GatewayStatus,
    RefundRequest, StartPaymentRequest, VoidRequest,
};
