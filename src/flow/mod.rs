// The payment flow state machine: state, context, and the machine itself.
pub mod context;
pub mod machine;
pub mod state;

pub use context::PaymentFlowContext;
pub use machine::{FlowHandle, PaymentFlow, PaymentFlowBuilder};
pub use state::FlowState;
