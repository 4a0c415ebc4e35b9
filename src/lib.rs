//! Payflow
//!
//! Payment flow orchestration engine: a provider-agnostic state machine that
//! drives a single payment attempt from initiation to terminal outcome, with
//! multi-provider fallback, webhook/redirect normalization, and outbound
//! rate limiting. Provider gateways, persistence, and telemetry sinks are
//! injected capabilities; the engine knows nothing about transport.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod config;
pub mod errors;
pub mod events;
pub mod fallback;
pub mod flow;
pub mod models;
pub mod normalizers;
pub mod pipeline;
pub mod providers;
pub mod rate_limiter;
pub mod webhooks;

pub use config::EngineConfig;
pub use errors::{ConfigError, ErrorCode, PaymentError, Violation};
pub use events::{FallbackAvailableEvent, FallbackUserResponse, FlowEvent};
pub use fallback::{FallbackConfig, FallbackMode, FallbackState, FallbackStatus};
pub use flow::{FlowHandle, FlowState, PaymentFlow, PaymentFlowBuilder, PaymentFlowContext};
pub use models::{
    Money, NextAction, OrderId, PaymentIntent, ProviderId, StartPaymentRequest,
};
pub use pipeline::{FlowSnapshot, SnapshotStore, TelemetrySink};
pub use providers::{PaymentGateway, ProviderOperations};
pub use rate_limiter::{RateLimitConfig, RateLimiter};
pub use webhooks::{WebhookIntake, WebhookVerifier};
