use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use super::context::PaymentFlowContext;
use super::state::FlowState;
use crate::config::EngineConfig;
use crate::errors::{ConfigError, ErrorCode, PaymentError};
use crate::events::{
    FallbackAvailableEvent, FallbackUserResponse, FlowEvent, OpToken, TelemetryEvent,
    TelemetryKind,
};
use crate::fallback::{FallbackConfig, FallbackOrchestrator, FallbackState};
use crate::models::{
    ActionKind, CancelPaymentRequest, ConfirmPaymentRequest, FlowId, IntentId, IntentStatus,
    PaymentIntent, ProviderId, StartPaymentRequest,
};
use crate::pipeline::{
    FlowSnapshot, NoopSnapshotStore, NoopTelemetrySink, PipelineItem, SnapshotPipeline,
    SnapshotStore, TelemetrySink,
};
use crate::providers::{ProviderOperations, RateLimitedOperations};
use crate::rate_limiter::RateLimiter;
use validator::Validate;

/// Builder wiring every external capability into a flow machine. All
/// dependencies are explicit constructor parameters; nothing is resolved
/// from an ambient registry.
pub struct PaymentFlowBuilder {
    ops: Arc<dyn ProviderOperations>,
    telemetry: Arc<dyn TelemetrySink>,
    store: Arc<dyn SnapshotStore>,
    fallback: FallbackConfig,
    limiter: Option<Arc<RateLimiter>>,
}

impl PaymentFlowBuilder {
    pub fn new(ops: Arc<dyn ProviderOperations>) -> Self {
        Self {
            ops,
            telemetry: Arc::new(NoopTelemetrySink),
            store: Arc::new(NoopSnapshotStore),
            fallback: FallbackConfig::default(),
            limiter: None,
        }
    }

    pub fn telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = sink;
        self
    }

    pub fn snapshot_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.store = store;
        self
    }

    pub fn fallback_config(mut self, config: FallbackConfig) -> Self {
        self.fallback = config;
        self
    }

    /// Gate outbound provider calls through this limiter.
    pub fn rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Apply a validated [`EngineConfig`]: fallback policy plus optional
    /// outbound rate limiting.
    pub fn engine_config(mut self, config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        self.fallback = config.fallback;
        if let Some(settings) = config.rate_limit {
            let limiter = RateLimiter::new(settings)
                .map_err(|err| ConfigError::Validation(err.to_string()))?;
            self.limiter = Some(Arc::new(limiter));
        }
        Ok(self)
    }

    /// Build the machine and spawn its pipeline worker. Must be called from
    /// within a tokio runtime. Fails fast on invalid fallback configuration.
    pub fn build(self) -> Result<FlowHandle, ConfigError> {
        let (command_tx, mut command_rx) = mpsc::unbounded_channel::<FlowEvent>();
        let (offer_tx, offer_rx) = mpsc::unbounded_channel::<FallbackAvailableEvent>();
        let (pipeline_tx, pipeline_rx) = mpsc::unbounded_channel::<PipelineItem>();

        let fallback = FallbackOrchestrator::new(self.fallback, command_tx, offer_tx)?;

        let ops: Arc<dyn ProviderOperations> = match self.limiter {
            Some(limiter) => Arc::new(RateLimitedOperations::new(self.ops, limiter)),
            None => self.ops,
        };

        let core = Arc::new(FlowCore {
            inner: Mutex::new(Inner {
                state: FlowState::Idle,
                ctx: PaymentFlowContext::new(FlowId::generate()),
                seq: 0,
            }),
            ops,
            fallback: fallback.clone(),
            pipeline: pipeline_tx,
        });

        SnapshotPipeline::spawn(pipeline_rx, self.telemetry, self.store, fallback);

        // Forward orchestrator write-backs into the machine. Holding only a
        // weak reference lets the machine (and with it the orchestrator and
        // its timers) shut down once the caller drops every handle.
        let weak: Weak<FlowCore> = Arc::downgrade(&core);
        tokio::spawn(async move {
            while let Some(event) = command_rx.recv().await {
                let Some(core) = weak.upgrade() else { break };
                PaymentFlow { core }.send(event);
            }
        });

        Ok(FlowHandle {
            flow: PaymentFlow { core },
            offers: offer_rx,
        })
    }
}

/// A built machine plus the stream of fallback offers it emits.
pub struct FlowHandle {
    pub flow: PaymentFlow,
    pub offers: mpsc::UnboundedReceiver<FallbackAvailableEvent>,
}

struct Inner {
    state: FlowState,
    ctx: PaymentFlowContext,
    seq: u64,
}

struct FlowCore {
    inner: Mutex<Inner>,
    ops: Arc<dyn ProviderOperations>,
    fallback: Arc<FallbackOrchestrator>,
    pipeline: mpsc::UnboundedSender<PipelineItem>,
}

/// Asynchronous work a transition kicked off. Spawned after the state lock
/// is released; results come back as ordinary system events.
enum Effect {
    Start {
        provider: ProviderId,
        request: StartPaymentRequest,
        token: OpToken,
    },
    Confirm {
        provider: ProviderId,
        request: ConfirmPaymentRequest,
        token: OpToken,
    },
    Cancel {
        provider: ProviderId,
        request: CancelPaymentRequest,
        token: OpToken,
    },
    FetchStatus {
        provider: ProviderId,
        intent_id: IntentId,
        token: OpToken,
    },
    Finalize {
        provider: ProviderId,
        intent_id: IntentId,
        token: OpToken,
    },
    FallbackRespond(FallbackUserResponse),
    /// Ledger append for a fallback execution. Runs before the new start
    /// operation so a fast-failing retry cannot race the ledger.
    RecordFallback { target: ProviderId },
    /// Prompt timer cancellation on RESET / FALLBACK_ABORT.
    ResetFallback,
    AbortFallback,
}

/// The payment flow state machine.
///
/// `send` is synchronous with respect to the state transition: the new state
/// is observable when it returns, while any operation the transition invoked
/// runs on a spawned task and reports back as a follow-up system event. All
/// event delivery is serialized through one lock, so no two transitions
/// interleave.
#[derive(Clone)]
pub struct PaymentFlow {
    core: Arc<FlowCore>,
}

impl PaymentFlow {
    pub fn state(&self) -> FlowState {
        self.lock_inner().state
    }

    pub fn context(&self) -> PaymentFlowContext {
        self.lock_inner().ctx.clone()
    }

    pub fn flow_id(&self) -> FlowId {
        self.lock_inner().ctx.flow_id
    }

    /// Orchestrator state, for inspection and assertions.
    pub fn fallback_state(&self) -> FallbackState {
        self.core.fallback.state()
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        match self.core.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Deliver one command or system event. Returns the state after the
    /// transition (or the unchanged state for events that do not apply).
    pub fn send(&self, event: FlowEvent) -> FlowState {
        let mut effects: Vec<Effect> = Vec::new();
        let mut items: Vec<PipelineItem> = Vec::new();

        let new_state = {
            let mut inner = self.lock_inner();
            if event.is_command() {
                items.push(PipelineItem::Telemetry(
                    TelemetryEvent::now(TelemetryKind::CommandSent, inner.ctx.flow_id)
                        .with_trigger(event.kind())
                        .with_provider(inner.ctx.provider.clone()),
                ));
            }
            self.apply(&mut inner, event, &mut effects, &mut items);
            // Enqueue while still holding the lock: concurrent sends commit
            // transitions in lock order, and the pipeline must see their
            // snapshots in that same order. The channel send never blocks.
            for item in items {
                let _ = self.core.pipeline.send(item);
            }
            inner.state
        };

        for effect in effects {
            self.run_effect(effect);
        }
        new_state
    }

    // Transition table. State changes happen only here, under the lock.
    fn apply(
        &self,
        inner: &mut Inner,
        event: FlowEvent,
        effects: &mut Vec<Effect>,
        items: &mut Vec<PipelineItem>,
    ) {
        let kind = event.kind();
        match event {
            FlowEvent::Start(request) => {
                if inner.state != FlowState::Idle {
                    self.drop_event(inner, kind, "not idle", items);
                    return;
                }
                if let Err(err) = request.validate() {
                    inner.ctx.provider = Some(request.provider.clone());
                    inner.ctx.start_request = Some(request);
                    let error = PaymentError::invalid_request("payment.error.invalid_request")
                        .with_params(serde_json::json!({ "violations": err.to_string() }));
                    self.fail_with(inner, error, kind, items);
                    return;
                }
                let provider = request.provider.clone();
                let token = inner.ctx.begin_attempt(request.clone());
                self.transition(inner, FlowState::Starting, kind, items);
                effects.push(Effect::Start {
                    provider,
                    request,
                    token,
                });
            }

            FlowEvent::Confirm(request) => {
                let awaiting_confirm = matches!(
                    inner.state,
                    FlowState::RequiresAction(ActionKind::ClientConfirm)
                        | FlowState::RequiresAction(ActionKind::ManualStep)
                );
                if !awaiting_confirm {
                    self.drop_event(inner, kind, "not awaiting confirmation", items);
                    return;
                }
                let Some(provider) = inner.ctx.provider.clone() else {
                    self.drop_event(inner, kind, "no provider selected", items);
                    return;
                };
                inner.ctx.confirm_request = Some(request.clone());
                let token = inner.ctx.begin_operation();
                self.transition(inner, FlowState::Confirming, kind, items);
                effects.push(Effect::Confirm {
                    provider,
                    request,
                    token,
                });
            }

            FlowEvent::Cancel { reason } => {
                if inner.state.is_terminal() {
                    self.drop_event(inner, kind, "already terminal", items);
                    return;
                }
                match (inner.ctx.provider.clone(), inner.ctx.intent.clone()) {
                    (Some(provider), Some(intent)) => {
                        let request = CancelPaymentRequest {
                            intent_id: intent.id.clone(),
                            reason,
                        };
                        inner.ctx.cancel_request = Some(request.clone());
                        let token = inner.ctx.begin_operation();
                        self.transition(inner, FlowState::Cancelling, kind, items);
                        effects.push(Effect::Cancel {
                            provider,
                            request,
                            token,
                        });
                    }
                    _ => {
                        // Nothing in flight at the provider; cancel locally.
                        inner.ctx.op_token = None;
                        self.transition(inner, FlowState::Cancelling, kind, items);
                        self.transition(inner, FlowState::Done, kind, items);
                    }
                }
            }

            FlowEvent::Refresh => {
                let refreshable = matches!(
                    inner.state,
                    FlowState::Done | FlowState::Failed | FlowState::RequiresAction(_)
                );
                if !refreshable {
                    self.drop_event(inner, kind, "not refreshable", items);
                    return;
                }
                let (Some(provider), Some(intent)) =
                    (inner.ctx.provider.clone(), inner.ctx.intent.clone())
                else {
                    self.drop_event(inner, kind, "no intent to refresh", items);
                    return;
                };
                let token = inner.ctx.begin_operation();
                self.transition(inner, FlowState::FetchingStatus, kind, items);
                effects.push(Effect::FetchStatus {
                    provider,
                    intent_id: intent.id,
                    token,
                });
            }

            FlowEvent::Reset => {
                inner.ctx.reset();
                self.transition(inner, FlowState::Idle, kind, items);
                effects.push(Effect::ResetFallback);
            }

            FlowEvent::ProviderUpdate {
                token,
                provider,
                outcome,
            } => {
                let awaiting = matches!(
                    inner.state,
                    FlowState::Starting
                        | FlowState::Confirming
                        | FlowState::Cancelling
                        | FlowState::Finalizing
                );
                if !awaiting || inner.ctx.op_token != Some(token) {
                    self.drop_event(inner, kind, "stale provider result", items);
                    return;
                }
                if inner.ctx.provider.as_ref() != Some(&provider) {
                    self.drop_event(inner, kind, "provider mismatch", items);
                    return;
                }
                inner.ctx.op_token = None;

                match (inner.state, outcome) {
                    (FlowState::Cancelling, Ok(intent)) => {
                        inner.ctx.adopt_intent(intent);
                        self.transition(inner, FlowState::Done, kind, items);
                    }
                    (FlowState::Finalizing, Ok(intent)) => {
                        inner.ctx.adopt_intent(intent);
                        self.enter_reconciling(inner, kind, items);
                    }
                    (FlowState::Finalizing, Err(error)) if error.is_unsupported_finalize() => {
                        // Not all providers have a finalize step; absence of
                        // support is not a failure.
                        debug!(flow_id = %inner.ctx.flow_id, "finalize unsupported, skipping");
                        inner.ctx.last_error = None;
                        self.enter_reconciling(inner, kind, items);
                    }
                    (_, Ok(intent)) => self.apply_intent(inner, intent, kind, effects, items),
                    (_, Err(error)) => self.fail_with(inner, error, kind, items),
                }
            }

            FlowEvent::StatusConfirmed {
                token,
                provider,
                outcome,
            } => {
                if inner.state != FlowState::FetchingStatus || inner.ctx.op_token != Some(token) {
                    self.drop_event(inner, kind, "stale status result", items);
                    return;
                }
                if inner.ctx.provider.as_ref() != Some(&provider) {
                    self.drop_event(inner, kind, "provider mismatch", items);
                    return;
                }
                inner.ctx.op_token = None;
                match outcome {
                    Ok(intent) => self.apply_intent(inner, intent, kind, effects, items),
                    Err(error) => self.fail_with(inner, error, kind, items),
                }
            }

            FlowEvent::RedirectReturned(ret) => {
                if inner.state != FlowState::RequiresAction(ActionKind::Redirect) {
                    self.drop_event(inner, kind, "no redirect outstanding", items);
                    return;
                }
                if !inner.ctx.accepts_nonce(&ret.reference_id) {
                    // Provider retries and stale returns are accepted but
                    // must not re-trigger completed side effects.
                    self.drop_event(inner, kind, "nonce mismatch or already reconciled", items);
                    return;
                }
                self.begin_finalize(inner, kind, effects, items);
            }

            FlowEvent::WebhookReceived(hook) => {
                if !matches!(inner.state, FlowState::RequiresAction(_)) {
                    self.drop_event(inner, kind, "no external step outstanding", items);
                    return;
                }
                if !inner.ctx.accepts_nonce(&hook.reference_id) {
                    self.drop_event(inner, kind, "nonce mismatch or already reconciled", items);
                    return;
                }
                // Webhooks are hints; confirm the status with the provider.
                self.begin_status_fetch(inner, kind, effects, items);
            }

            FlowEvent::ExternalStatusUpdated { reference_id, .. } => {
                let waiting = matches!(
                    inner.state,
                    FlowState::RequiresAction(ActionKind::ExternalWait)
                        | FlowState::RequiresAction(ActionKind::ManualStep)
                );
                if !waiting {
                    self.drop_event(inner, kind, "not waiting on external status", items);
                    return;
                }
                if !inner.ctx.accepts_nonce(&reference_id) {
                    self.drop_event(inner, kind, "nonce mismatch or already reconciled", items);
                    return;
                }
                self.begin_status_fetch(inner, kind, effects, items);
            }

            FlowEvent::ValidationFailed(error) => {
                if inner.state.is_terminal() || inner.state == FlowState::Idle {
                    self.drop_event(inner, kind, "no attempt in progress", items);
                    return;
                }
                self.fail_with(inner, error, kind, items);
            }

            FlowEvent::FallbackRequested(response) => {
                // No state change here; the orchestrator validates the
                // response and writes back through its command channel.
                effects.push(Effect::FallbackRespond(response));
            }

            FlowEvent::FallbackExecute { target, request } => {
                if inner.state != FlowState::FallbackCandidate {
                    self.drop_event(inner, kind, "no fallback candidate", items);
                    return;
                }
                let request = request.retargeted(target.clone());
                let token = inner.ctx.begin_attempt(request.clone());
                self.transition(inner, FlowState::Starting, kind, items);
                effects.push(Effect::RecordFallback {
                    target: target.clone(),
                });
                effects.push(Effect::Start {
                    provider: target,
                    request,
                    token,
                });
            }

            FlowEvent::FallbackAbort => {
                if inner.state != FlowState::FallbackCandidate {
                    self.drop_event(inner, kind, "no fallback candidate", items);
                    return;
                }
                self.transition(inner, FlowState::Done, kind, items);
                effects.push(Effect::AbortFallback);
            }
        }
    }

    /// Deterministic mapping from a fresh intent to the next state.
    fn apply_intent(
        &self,
        inner: &mut Inner,
        intent: PaymentIntent,
        trigger: &'static str,
        effects: &mut Vec<Effect>,
        items: &mut Vec<PipelineItem>,
    ) {
        let status = intent.status;
        let action_kind = intent.next_action.as_ref().map(|a| a.kind());
        inner.ctx.adopt_intent(intent);

        match status {
            IntentStatus::Succeeded => self.begin_finalize(inner, trigger, effects, items),
            IntentStatus::Failed | IntentStatus::Canceled => {
                let error = PaymentError::new(
                    ErrorCode::ProviderError,
                    "payment.error.intent_terminal",
                )
                .with_params(serde_json::json!({ "status": status.to_string() }));
                self.fail_with(inner, error, trigger, items);
            }
            IntentStatus::RequiresAction => {
                let kind = action_kind.unwrap_or(ActionKind::ExternalWait);
                self.transition(inner, FlowState::RequiresAction(kind), trigger, items);
            }
            IntentStatus::RequiresConfirmation | IntentStatus::RequiresPaymentMethod => {
                self.transition(
                    inner,
                    FlowState::RequiresAction(ActionKind::ClientConfirm),
                    trigger,
                    items,
                );
            }
            IntentStatus::Processing => {
                // Settlement arrives via webhook or REFRESH polling.
                self.transition(
                    inner,
                    FlowState::RequiresAction(ActionKind::ExternalWait),
                    trigger,
                    items,
                );
            }
        }
    }

    fn begin_finalize(
        &self,
        inner: &mut Inner,
        trigger: &'static str,
        effects: &mut Vec<Effect>,
        items: &mut Vec<PipelineItem>,
    ) {
        let (Some(provider), Some(intent)) =
            (inner.ctx.provider.clone(), inner.ctx.intent.clone())
        else {
            self.fail_with(inner, PaymentError::unknown(), trigger, items);
            return;
        };
        let token = inner.ctx.begin_operation();
        self.transition(inner, FlowState::Finalizing, trigger, items);
        effects.push(Effect::Finalize {
            provider,
            intent_id: intent.id,
            token,
        });
    }

    fn begin_status_fetch(
        &self,
        inner: &mut Inner,
        trigger: &'static str,
        effects: &mut Vec<Effect>,
        items: &mut Vec<PipelineItem>,
    ) {
        let (Some(provider), Some(intent)) =
            (inner.ctx.provider.clone(), inner.ctx.intent.clone())
        else {
            self.drop_event(inner, trigger, "no intent to fetch", items);
            return;
        };
        let token = inner.ctx.begin_operation();
        self.transition(inner, FlowState::FetchingStatus, trigger, items);
        effects.push(Effect::FetchStatus {
            provider,
            intent_id: intent.id,
            token,
        });
    }

    /// Reconciling is bookkeeping: mark the nonce reconciled, then settle.
    fn enter_reconciling(
        &self,
        inner: &mut Inner,
        trigger: &'static str,
        items: &mut Vec<PipelineItem>,
    ) {
        self.transition(inner, FlowState::Reconciling, trigger, items);
        inner.ctx.mark_reconciled();
        self.transition(inner, FlowState::Done, trigger, items);
    }

    /// Enter `Failed`, then auto-transition to `FallbackCandidate` when the
    /// eligibility guard passes and alternatives remain.
    fn fail_with(
        &self,
        inner: &mut Inner,
        error: PaymentError,
        trigger: &'static str,
        items: &mut Vec<PipelineItem>,
    ) {
        inner.ctx.op_token = None;
        inner.ctx.last_error = Some(error.clone());
        self.transition(inner, FlowState::Failed, trigger, items);

        let Some(provider) = inner.ctx.provider.clone() else {
            return;
        };
        if inner.ctx.start_request.is_none() {
            return;
        }
        let alternatives = self.core.fallback.eligible_alternatives(&provider, &error);
        if alternatives.is_empty() {
            return;
        }
        inner.ctx.fallback_from = Some(provider);
        inner.ctx.fallback_candidates = alternatives;
        inner.ctx.fallback_event_id = Some(Uuid::new_v4());
        self.transition(inner, FlowState::FallbackCandidate, trigger, items);
    }

    fn transition(
        &self,
        inner: &mut Inner,
        to: FlowState,
        trigger: &'static str,
        items: &mut Vec<PipelineItem>,
    ) {
        let from = inner.state;
        inner.state = to;
        inner.seq += 1;
        info!(flow_id = %inner.ctx.flow_id, from = from.label(), to = to.label(), trigger,
            "flow transition");
        items.push(PipelineItem::Snapshot {
            snapshot: Box::new(FlowSnapshot {
                seq: inner.seq,
                flow_id: inner.ctx.flow_id,
                from,
                to,
                trigger: trigger.to_string(),
                context: inner.ctx.clone(),
                at: chrono::Utc::now(),
            }),
            offer_generation: self.core.fallback.generation(),
        });
    }

    /// Accepted-but-inapplicable events: logged, counted, never a failure.
    fn drop_event(
        &self,
        inner: &Inner,
        trigger: &'static str,
        reason: &'static str,
        items: &mut Vec<PipelineItem>,
    ) {
        debug!(flow_id = %inner.ctx.flow_id, state = inner.state.label(), trigger, reason,
            "event did not apply");
        items.push(PipelineItem::Telemetry(
            TelemetryEvent::now(TelemetryKind::EventDropped, inner.ctx.flow_id)
                .with_trigger(trigger)
                .with_provider(inner.ctx.provider.clone()),
        ));
    }

    fn run_effect(&self, effect: Effect) {
        match effect {
            Effect::Start {
                provider,
                request,
                token,
            } => {
                let flow = self.clone();
                tokio::spawn(async move {
                    let outcome = flow.core.ops.start_payment(&provider, &request).await;
                    flow.send(FlowEvent::ProviderUpdate {
                        token,
                        provider,
                        outcome,
                    });
                });
            }
            Effect::Confirm {
                provider,
                request,
                token,
            } => {
                let flow = self.clone();
                tokio::spawn(async move {
                    let outcome = flow.core.ops.confirm_payment(&provider, &request).await;
                    flow.send(FlowEvent::ProviderUpdate {
                        token,
                        provider,
                        outcome,
                    });
                });
            }
            Effect::Cancel {
                provider,
                request,
                token,
            } => {
                let flow = self.clone();
                tokio::spawn(async move {
                    let outcome = flow.core.ops.cancel_payment(&provider, &request).await;
                    flow.send(FlowEvent::ProviderUpdate {
                        token,
                        provider,
                        outcome,
                    });
                });
            }
            Effect::FetchStatus {
                provider,
                intent_id,
                token,
            } => {
                let flow = self.clone();
                tokio::spawn(async move {
                    let outcome = flow.core.ops.get_status(&provider, &intent_id).await;
                    flow.send(FlowEvent::StatusConfirmed {
                        token,
                        provider,
                        outcome,
                    });
                });
            }
            Effect::Finalize {
                provider,
                intent_id,
                token,
            } => {
                let flow = self.clone();
                tokio::spawn(async move {
                    let outcome = flow.core.ops.finalize_payment(&provider, &intent_id).await;
                    flow.send(FlowEvent::ProviderUpdate {
                        token,
                        provider,
                        outcome,
                    });
                });
            }
            Effect::FallbackRespond(response) => {
                self.core.fallback.handle_user_response(response);
            }
            Effect::RecordFallback { target } => {
                self.core.fallback.record_execution(&target);
            }
            Effect::ResetFallback => {
                self.core.fallback.reset();
            }
            Effect::AbortFallback => {
                self.core.fallback.abort();
            }
        }
    }
}
