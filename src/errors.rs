use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumString};

/// Message key attached to finalize failures from providers that have no
/// finalize step. The flow treats these as a no-op, not a failure.
pub const FINALIZE_UNSUPPORTED_KEY: &str = "payment.error.finalize_unsupported";

/// Closed taxonomy of normalized payment error codes.
///
/// Provider adapters must map every raw failure onto one of these before it
/// reaches the flow machine; the machine never sees an unstructured error.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorCode {
    InvalidRequest,
    CardDeclined,
    InsufficientFunds,
    ExpiredCard,
    ProviderUnavailable,
    ProviderError,
    NetworkError,
    Timeout,
    UnknownError,
}

impl ErrorCode {
    /// Codes that describe a definitive decision about the payment method
    /// itself rather than a transport or provider fault.
    pub fn is_definitive_decline(&self) -> bool {
        matches!(
            self,
            ErrorCode::CardDeclined | ErrorCode::InsufficientFunds | ErrorCode::ExpiredCard
        )
    }
}

/// Normalized payment error carried through the flow.
///
/// `message_key` is an opaque i18n key resolved by the caller's catalog; the
/// core never produces rendered text. `raw` keeps the provider payload for
/// diagnostics only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("payment error [{code}]: {message_key}")]
pub struct PaymentError {
    pub code: ErrorCode,
    pub message_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
}

impl PaymentError {
    pub fn new(code: ErrorCode, message_key: impl Into<String>) -> Self {
        Self {
            code,
            message_key: message_key.into(),
            params: None,
            raw: None,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }

    pub fn with_raw(mut self, raw: Value) -> Self {
        self.raw = Some(raw);
        self
    }

    pub fn invalid_request(message_key: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message_key)
    }

    pub fn provider_unavailable() -> Self {
        Self::new(
            ErrorCode::ProviderUnavailable,
            "payment.error.provider_unavailable",
        )
    }

    pub fn network_error() -> Self {
        Self::new(ErrorCode::NetworkError, "payment.error.network")
    }

    pub fn timeout() -> Self {
        Self::new(ErrorCode::Timeout, "payment.error.timeout")
    }

    pub fn unknown() -> Self {
        Self::new(ErrorCode::UnknownError, "payment.error.unknown")
    }

    /// Rejection from the outbound rate limiter. There is no throttling code
    /// in the taxonomy; a saturated provider is reported as unavailable so
    /// the fallback policy can route around it.
    pub fn rate_limited(retry_after_ms: u64) -> Self {
        Self::new(ErrorCode::ProviderUnavailable, "payment.error.rate_limited")
            .with_params(serde_json::json!({ "retry_after_ms": retry_after_ms }))
    }

    /// Finalize failure from a provider that has no finalize step.
    pub fn unsupported_finalize() -> Self {
        Self::new(ErrorCode::ProviderError, FINALIZE_UNSUPPORTED_KEY)
    }

    /// Guard for the finalize exception policy: absence of a finalize step
    /// must not be conflated with failure.
    pub fn is_unsupported_finalize(&self) -> bool {
        self.code == ErrorCode::ProviderError && self.message_key == FINALIZE_UNSUPPORTED_KEY
    }
}

/// Violation raised by the fallible value-object constructors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Violation {
    #[error("{field} must not be empty")]
    Empty { field: &'static str },

    #[error("{field} contains invalid characters: '{value}'")]
    Malformed { field: &'static str, value: String },

    #[error("amount must not be negative")]
    NegativeAmount,

    #[error("currency must be a 3-letter uppercase code, got '{0}'")]
    InvalidCurrency(String),
}

/// Fatal configuration error raised at startup, never per flow.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown error code '{code}' in {field}")]
    UnknownErrorCode { field: &'static str, code: String },

    #[error("provider_priority must not be empty")]
    EmptyProviderPriority,

    #[error("max_attempts must be greater than zero")]
    ZeroMaxAttempts,

    #[error("{field} must be greater than zero")]
    ZeroDuration { field: &'static str },

    #[error("validation failed: {0}")]
    Validation(String),
}

impl From<validator::ValidationErrors> for ConfigError {
    fn from(err: validator::ValidationErrors) -> Self {
        ConfigError::Validation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn error_codes_round_trip_snake_case() {
        assert_eq!(
            ErrorCode::from_str("provider_unavailable").unwrap(),
            ErrorCode::ProviderUnavailable
        );
        assert_eq!(ErrorCode::CardDeclined.to_string(), "card_declined");
        assert!(ErrorCode::from_str("charge_declined").is_err());
    }

    #[test]
    fn unsupported_finalize_guard_requires_both_code_and_key() {
        assert!(PaymentError::unsupported_finalize().is_unsupported_finalize());
        assert!(
            !PaymentError::new(ErrorCode::ProviderError, "payment.error.other")
                .is_unsupported_finalize()
        );
        assert!(
            !PaymentError::new(ErrorCode::Timeout, FINALIZE_UNSUPPORTED_KEY)
                .is_unsupported_finalize()
        );
    }

    #[test]
    fn rate_limited_maps_to_provider_unavailable() {
        let err = PaymentError::rate_limited(500);
        assert_eq!(err.code, ErrorCode::ProviderUnavailable);
        assert_eq!(err.params.unwrap()["retry_after_ms"], 500);
    }
}
