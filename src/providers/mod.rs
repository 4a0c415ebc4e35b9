/*!
 * Consumed provider contracts.
 *
 * The flow machine drives payments exclusively through these traits; it has
 * zero knowledge of transport, SDKs, or HTTP. Implementations must catch
 * every provider-layer failure at the operation boundary and convert it to a
 * normalized [`PaymentError`] — the machine never receives a raw failure.
 */
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::errors::PaymentError;
use crate::models::{
    CancelPaymentRequest, CaptureRequest, ConfirmPaymentRequest, GatewayResult, IntentId,
    PaymentIntent, ProviderId, RefundRequest, StartPaymentRequest, VoidRequest,
};
use crate::rate_limiter::RateLimiter;

/// The four payment operations plus the optional finalize step.
#[async_trait]
pub trait ProviderOperations: Send + Sync {
    async fn start_payment(
        &self,
        provider: &ProviderId,
        request: &StartPaymentRequest,
    ) -> Result<PaymentIntent, PaymentError>;

    async fn confirm_payment(
        &self,
        provider: &ProviderId,
        request: &ConfirmPaymentRequest,
    ) -> Result<PaymentIntent, PaymentError>;

    async fn cancel_payment(
        &self,
        provider: &ProviderId,
        request: &CancelPaymentRequest,
    ) -> Result<PaymentIntent, PaymentError>;

    async fn get_status(
        &self,
        provider: &ProviderId,
        intent_id: &IntentId,
    ) -> Result<PaymentIntent, PaymentError>;

    /// Settle any provider-side finalize step. Providers without one report
    /// the unsupported-finalize error, which the flow treats as a no-op.
    async fn finalize_payment(
        &self,
        provider: &ProviderId,
        intent_id: &IntentId,
    ) -> Result<PaymentIntent, PaymentError> {
        let _ = (provider, intent_id);
        Err(PaymentError::unsupported_finalize())
    }
}

/// Post-authorization money movement: capture, refund, void.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn capture(&self, request: &CaptureRequest) -> Result<GatewayResult, PaymentError>;

    async fn refund(&self, request: &RefundRequest) -> Result<GatewayResult, PaymentError>;

    async fn void(&self, request: &VoidRequest) -> Result<GatewayResult, PaymentError>;
}

/// Decorator gating every outbound operation through the rate limiter.
///
/// Keys are `{provider}:{operation}` so each provider endpoint gets its own
/// window; a rejected admission surfaces as a rate-limited payment error
/// without touching the wrapped operations.
pub struct RateLimitedOperations {
    inner: Arc<dyn ProviderOperations>,
    limiter: Arc<RateLimiter>,
}

impl RateLimitedOperations {
    pub fn new(inner: Arc<dyn ProviderOperations>, limiter: Arc<RateLimiter>) -> Self {
        Self { inner, limiter }
    }

    fn admit(&self, provider: &ProviderId, operation: &str) -> Result<(), PaymentError> {
        let key = format!("{}:{}", provider, operation);
        let result = self.limiter.check(&key);
        if result.allowed {
            Ok(())
        } else {
            debug!(%provider, operation, retry_after_ms = result.retry_after.as_millis() as u64,
                "outbound call rejected by rate limiter");
            Err(PaymentError::rate_limited(
                result.retry_after.as_millis() as u64
            ))
        }
    }
}

#[async_trait]
impl ProviderOperations for RateLimitedOperations {
    async fn start_payment(
        &self,
        provider: &ProviderId,
        request: &StartPaymentRequest,
    ) -> Result<PaymentIntent, PaymentError> {
        self.admit(provider, "start_payment")?;
        self.inner.start_payment(provider, request).await
    }

    async fn confirm_payment(
        &self,
        provider: &ProviderId,
        request: &ConfirmPaymentRequest,
    ) -> Result<PaymentIntent, PaymentError> {
        self.admit(provider, "confirm_payment")?;
        self.inner.confirm_payment(provider, request).await
    }

    async fn cancel_payment(
        &self,
        provider: &ProviderId,
        request: &CancelPaymentRequest,
    ) -> Result<PaymentIntent, PaymentError> {
        self.admit(provider, "cancel_payment")?;
        self.inner.cancel_payment(provider, request).await
    }

    async fn get_status(
        &self,
        provider: &ProviderId,
        intent_id: &IntentId,
    ) -> Result<PaymentIntent, PaymentError> {
        self.admit(provider, "get_status")?;
        self.inner.get_status(provider, intent_id).await
    }

    async fn finalize_payment(
        &self,
        provider: &ProviderId,
        intent_id: &IntentId,
    ) -> Result<PaymentIntent, PaymentError> {
        self.admit(provider, "finalize_payment")?;
        self.inner.finalize_payment(provider, intent_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorCode;
    use crate::models::{IntentStatus, Money, OrderId};
    use crate::rate_limiter::RateLimitConfig;
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;
    use std::time::Duration;

    struct AlwaysSucceeds;

    #[async_trait]
    impl ProviderOperations for AlwaysSucceeds {
        async fn start_payment(
            &self,
            provider: &ProviderId,
            request: &StartPaymentRequest,
        ) -> Result<PaymentIntent, PaymentError> {
            Ok(PaymentIntent {
                id: IntentId::new("pi_ok").unwrap(),
                provider: provider.clone(),
                status: IntentStatus::Succeeded,
                amount: request.amount,
                next_action: None,
                provider_refs: BTreeMap::new(),
                raw: None,
            })
        }

        async fn confirm_payment(
            &self,
            _provider: &ProviderId,
            _request: &ConfirmPaymentRequest,
        ) -> Result<PaymentIntent, PaymentError> {
            unimplemented!("not exercised")
        }

        async fn cancel_payment(
            &self,
            _provider: &ProviderId,
            _request: &CancelPaymentRequest,
        ) -> Result<PaymentIntent, PaymentError> {
            unimplemented!("not exercised")
        }

        async fn get_status(
            &self,
            _provider: &ProviderId,
            _intent_id: &IntentId,
        ) -> Result<PaymentIntent, PaymentError> {
            unimplemented!("not exercised")
        }
    }

    fn start_request(provider: &ProviderId) -> StartPaymentRequest {
        StartPaymentRequest {
            provider: provider.clone(),
            order_id: OrderId::new("ord_1").unwrap(),
            amount: Money::new(dec!(5.00), "USD").unwrap(),
            method_token: None,
            return_url: None,
            nonce: None,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn second_call_in_window_is_rate_limited() {
        let limiter = Arc::new(
            RateLimiter::new(RateLimitConfig {
                max_requests: 1,
                window: Duration::from_secs(60),
                endpoint_policies: Vec::new(),
            })
            .unwrap(),
        );
        let ops = RateLimitedOperations::new(Arc::new(AlwaysSucceeds), limiter);
        let stripe = ProviderId::new("stripe").unwrap();
        let request = start_request(&stripe);

        assert!(ops.start_payment(&stripe, &request).await.is_ok());
        let err = ops.start_payment(&stripe, &request).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ProviderUnavailable);
        assert_eq!(err.message_key, "payment.error.rate_limited");
    }

    #[tokio::test]
    async fn providers_do_not_share_windows() {
        let limiter = Arc::new(
            RateLimiter::new(RateLimitConfig {
                max_requests: 1,
                window: Duration::from_secs(60),
                endpoint_policies: Vec::new(),
            })
            .unwrap(),
        );
        let ops = RateLimitedOperations::new(Arc::new(AlwaysSucceeds), limiter);
        let stripe = ProviderId::new("stripe").unwrap();
        let paypal = ProviderId::new("paypal").unwrap();

        assert!(ops.start_payment(&stripe, &start_request(&stripe)).await.is_ok());
        assert!(ops.start_payment(&paypal, &start_request(&paypal)).await.is_ok());
    }

    #[tokio::test]
    async fn default_finalize_reports_unsupported() {
        let ops = AlwaysSucceeds;
        let stripe = ProviderId::new("stripe").unwrap();
        let err = ops
            .finalize_payment(&stripe, &IntentId::new("pi_1").unwrap())
            .await
            .unwrap_err();
        assert!(err.is_unsupported_finalize());
    }
}
