//! Shared harness for flow integration tests: a scripted provider backend,
//! recording sinks, and helpers for waiting on asynchronous settlement.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal_macros::dec;

use payflow::errors::PaymentError;
use payflow::events::TelemetryEvent;
use payflow::fallback::FallbackConfig;
use payflow::flow::{FlowHandle, FlowState, PaymentFlow, PaymentFlowBuilder};
use payflow::models::{
    CancelPaymentRequest, ConfirmPaymentRequest, IntentId, IntentStatus, Money, NextAction,
    OrderId, PaymentIntent, ProviderId, StartPaymentRequest,
};
use payflow::pipeline::{
    FlowSnapshot, SnapshotStore, StoreError, TelemetryError, TelemetrySink,
};
use payflow::providers::ProviderOperations;

pub fn provider(id: &str) -> ProviderId {
    ProviderId::new(id).expect("valid provider id")
}

pub fn start_request(provider_id: &str) -> StartPaymentRequest {
    StartPaymentRequest {
        provider: provider(provider_id),
        order_id: OrderId::new("ord_1001").unwrap(),
        amount: Money::new(dec!(49.99), "USD").unwrap(),
        method_token: Some("pm_tok_visa".into()),
        return_url: Some("https://shop.example/checkout/return".into()),
        nonce: None,
        metadata: None,
    }
}

pub fn intent(
    provider_id: &str,
    intent_id: &str,
    status: IntentStatus,
    next_action: Option<NextAction>,
) -> PaymentIntent {
    PaymentIntent {
        id: IntentId::new(intent_id).unwrap(),
        provider: provider(provider_id),
        status,
        amount: Money::new(dec!(49.99), "USD").unwrap(),
        next_action,
        provider_refs: BTreeMap::new(),
        raw: None,
    }
}

type ScriptedOutcome = (Duration, Result<PaymentIntent, PaymentError>);

/// Provider backend returning pre-scripted outcomes per `{provider}:{op}`,
/// optionally after a delay to exercise in-flight cancellation.
#[derive(Default)]
pub struct ScriptedOps {
    script: Mutex<HashMap<String, VecDeque<ScriptedOutcome>>>,
}

impl ScriptedOps {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, provider_id: &str, op: &str, outcome: Result<PaymentIntent, PaymentError>) {
        self.script_delayed(provider_id, op, Duration::ZERO, outcome);
    }

    pub fn script_delayed(
        &self,
        provider_id: &str,
        op: &str,
        delay: Duration,
        outcome: Result<PaymentIntent, PaymentError>,
    ) {
        self.script
            .lock()
            .unwrap()
            .entry(format!("{provider_id}:{op}"))
            .or_default()
            .push_back((delay, outcome));
    }

    async fn take(
        &self,
        provider_id: &ProviderId,
        op: &str,
    ) -> Result<PaymentIntent, PaymentError> {
        let next = self
            .script
            .lock()
            .unwrap()
            .get_mut(&format!("{provider_id}:{op}"))
            .and_then(VecDeque::pop_front);
        match next {
            Some((delay, outcome)) => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                outcome
            }
            None if op == "finalize_payment" => Err(PaymentError::unsupported_finalize()),
            None => Err(PaymentError::unknown()),
        }
    }
}

#[async_trait]
impl ProviderOperations for ScriptedOps {
    async fn start_payment(
        &self,
        provider: &ProviderId,
        _request: &StartPaymentRequest,
    ) -> Result<PaymentIntent, PaymentError> {
        self.take(provider, "start_payment").await
    }

    async fn confirm_payment(
        &self,
        provider: &ProviderId,
        _request: &ConfirmPaymentRequest,
    ) -> Result<PaymentIntent, PaymentError> {
        self.take(provider, "confirm_payment").await
    }

    async fn cancel_payment(
        &self,
        provider: &ProviderId,
        _request: &CancelPaymentRequest,
    ) -> Result<PaymentIntent, PaymentError> {
        self.take(provider, "cancel_payment").await
    }

    async fn get_status(
        &self,
        provider: &ProviderId,
        _intent_id: &IntentId,
    ) -> Result<PaymentIntent, PaymentError> {
        self.take(provider, "get_status").await
    }

    async fn finalize_payment(
        &self,
        provider: &ProviderId,
        _intent_id: &IntentId,
    ) -> Result<PaymentIntent, PaymentError> {
        self.take(provider, "finalize_payment").await
    }
}

/// Telemetry sink collecting every event it is handed.
#[derive(Default)]
pub struct RecordingTelemetry {
    pub events: Mutex<Vec<TelemetryEvent>>,
}

#[async_trait]
impl TelemetrySink for RecordingTelemetry {
    async fn record(&self, event: TelemetryEvent) -> Result<(), TelemetryError> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

/// Snapshot store collecting every snapshot in arrival order.
#[derive(Default)]
pub struct RecordingStore {
    pub snapshots: Mutex<Vec<FlowSnapshot>>,
}

impl RecordingStore {
    pub fn transitions(&self) -> Vec<(String, String)> {
        self.snapshots
            .lock()
            .unwrap()
            .iter()
            .map(|s| (s.from.label().to_string(), s.to.label().to_string()))
            .collect()
    }
}

#[async_trait]
impl SnapshotStore for RecordingStore {
    async fn handle_snapshot(&self, snapshot: &FlowSnapshot) -> Result<(), StoreError> {
        self.snapshots.lock().unwrap().push(snapshot.clone());
        Ok(())
    }
}

pub struct TestFlow {
    pub handle: FlowHandle,
    pub ops: Arc<ScriptedOps>,
    pub telemetry: Arc<RecordingTelemetry>,
    pub store: Arc<RecordingStore>,
}

impl TestFlow {
    pub fn flow(&self) -> &PaymentFlow {
        &self.handle.flow
    }
}

/// Build a flow wired to scripted providers and recording sinks.
pub fn build_flow(fallback: FallbackConfig) -> TestFlow {
    let ops = ScriptedOps::new();
    let telemetry = Arc::new(RecordingTelemetry::default());
    let store = Arc::new(RecordingStore::default());
    let handle = PaymentFlowBuilder::new(ops.clone())
        .telemetry(telemetry.clone())
        .snapshot_store(store.clone())
        .fallback_config(fallback)
        .build()
        .expect("valid fallback config");
    TestFlow {
        handle,
        ops,
        telemetry,
        store,
    }
}

pub fn manual_fallback(providers: &[&str]) -> FallbackConfig {
    FallbackConfig {
        provider_priority: providers.iter().map(|p| provider(p)).collect(),
        ..Default::default()
    }
}

/// Wait until the flow settles in `target`, or panic after the deadline.
pub async fn wait_for_state(flow: &PaymentFlow, target: FlowState) {
    wait_until(|| flow.state() == target, &format!("state {:?}", target)).await;
}

pub async fn wait_until(mut predicate: impl FnMut() -> bool, what: &str) {
    for _ in 0..500 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("timed out waiting for {what}");
}
