//! Property-based tests for flow context reset, fallback eligibility, and
//! query flattening invariants.

use std::collections::{BTreeMap, HashSet};

use proptest::prelude::*;
use rust_decimal::Decimal;

use payflow::errors::{ErrorCode, PaymentError};
use payflow::fallback::{is_eligible_for_fallback, FallbackConfig};
use payflow::flow::PaymentFlowContext;
use payflow::models::{
    FlowId, IntentId, IntentStatus, Money, OrderId, PaymentIntent, ProviderId,
    StartPaymentRequest,
};
use payflow::normalizers::flatten_query;

// Strategies for generating test data
fn error_code_strategy() -> impl Strategy<Value = ErrorCode> {
    prop_oneof![
        Just(ErrorCode::InvalidRequest),
        Just(ErrorCode::CardDeclined),
        Just(ErrorCode::InsufficientFunds),
        Just(ErrorCode::ExpiredCard),
        Just(ErrorCode::ProviderUnavailable),
        Just(ErrorCode::ProviderError),
        Just(ErrorCode::NetworkError),
        Just(ErrorCode::Timeout),
        Just(ErrorCode::UnknownError),
    ]
}

fn code_set_strategy() -> impl Strategy<Value = HashSet<ErrorCode>> {
    prop::collection::hash_set(error_code_strategy(), 0..6)
}

fn provider_strategy() -> impl Strategy<Value = ProviderId> {
    "[a-z]{3,8}".prop_map(|s| ProviderId::new(s).unwrap())
}

fn nonce_strategy() -> impl Strategy<Value = Option<String>> {
    prop::option::of("[a-z0-9]{4,16}")
}

fn amount_strategy() -> impl Strategy<Value = Decimal> {
    (0u64..10_000_000, 0u32..100)
        .prop_map(|(units, cents)| Decimal::new((units * 100 + cents as u64) as i64, 2))
}

fn start_request_strategy() -> impl Strategy<Value = StartPaymentRequest> {
    (provider_strategy(), "[a-z0-9]{4,12}", amount_strategy(), nonce_strategy()).prop_map(
        |(provider, order, amount, nonce)| StartPaymentRequest {
            provider,
            order_id: OrderId::new(format!("ord_{order}")).unwrap(),
            amount: Money::new(amount, "USD").unwrap(),
            method_token: None,
            return_url: None,
            nonce,
            metadata: None,
        },
    )
}

fn intent_strategy() -> impl Strategy<Value = PaymentIntent> {
    (provider_strategy(), "[a-z0-9]{4,12}", amount_strategy()).prop_map(
        |(provider, id, amount)| PaymentIntent {
            id: IntentId::new(format!("pi_{id}")).unwrap(),
            provider,
            status: IntentStatus::Processing,
            amount: Money::new(amount, "USD").unwrap(),
            next_action: None,
            provider_refs: BTreeMap::new(),
            raw: None,
        },
    )
}

// Property: any sequence of attempts/operations followed by reset restores
// the initial context — nothing leaks across a reset.
proptest! {
    #[test]
    fn reset_is_total(
        requests in prop::collection::vec(start_request_strategy(), 1..5),
        intents in prop::collection::vec(intent_strategy(), 0..5),
        reconcile_each in any::<bool>(),
    ) {
        let initial = PaymentFlowContext::new(FlowId::generate());
        let mut ctx = initial.clone();

        for request in requests {
            ctx.begin_attempt(request);
        }
        for intent in intents {
            ctx.adopt_intent(intent);
            if reconcile_each {
                ctx.mark_reconciled();
            }
            ctx.begin_operation();
        }

        ctx.reset();
        prop_assert_eq!(ctx, initial);
    }
}

// Property: eligibility is pure and blocked codes always win.
proptest! {
    #[test]
    fn eligibility_is_pure_and_blocked_wins(
        trigger in code_set_strategy(),
        blocked in code_set_strategy(),
        code in error_code_strategy(),
        providers in prop::collection::vec(provider_strategy(), 1..4),
    ) {
        let config = FallbackConfig {
            provider_priority: providers,
            trigger_error_codes: trigger.clone(),
            blocked_error_codes: blocked.clone(),
            ..Default::default()
        };
        let error = PaymentError::new(code, "payment.error.test");

        let first = is_eligible_for_fallback(&config, &error);
        let second = is_eligible_for_fallback(&config, &error);
        prop_assert_eq!(first, second, "eligibility must be deterministic");

        if blocked.contains(&code) {
            prop_assert!(!first, "blocked code must never be eligible");
        } else {
            prop_assert_eq!(first, trigger.contains(&code));
        }
    }
}

// Property: flattening keeps exactly the last occurrence of every key.
proptest! {
    #[test]
    fn flatten_query_last_occurrence_wins(
        params in prop::collection::vec(("[a-z]{1,5}", "[a-z0-9]{0,8}"), 0..20),
    ) {
        let pairs: Vec<(String, String)> = params;
        let flat = flatten_query(&pairs);

        for (key, value) in flat.iter() {
            let last = pairs.iter().rev().find(|(k, _)| k == key).map(|(_, v)| v);
            prop_assert_eq!(Some(value), last, "key {} must map to its last value", key);
        }
        let distinct: HashSet<&String> = pairs.iter().map(|(k, _)| k).collect();
        prop_assert_eq!(flat.len(), distinct.len());
    }
}
