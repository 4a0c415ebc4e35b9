/*!
 * Fallback orchestration.
 *
 * Decides, on a failed attempt, whether the flow may offer an alternate
 * provider; owns the pending-offer lifecycle and its timers; executes manual
 * or automatic fallback by re-entering the flow machine with a retargeted
 * start request — the only path by which it writes back into the machine.
 */
use chrono::Utc;
use metrics::counter;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::{ConfigError, ErrorCode, PaymentError};
use crate::events::{FallbackAvailableEvent, FallbackUserResponse, FlowEvent};
use crate::models::{ProviderId, StartPaymentRequest};

/// Whether fallback waits for the user or executes on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackMode {
    Manual,
    Auto,
}

/// Fallback policy. Validated once at startup; invalid configuration is
/// fatal, never a per-flow error.
#[derive(Debug, Clone)]
pub struct FallbackConfig {
    pub mode: FallbackMode,
    /// Providers in preference order; alternatives are drawn from here.
    pub provider_priority: Vec<ProviderId>,
    /// Codes that make a failure fallback-eligible.
    pub trigger_error_codes: HashSet<ErrorCode>,
    /// Codes that must never be retried on another provider. Takes
    /// precedence over the trigger set.
    pub blocked_error_codes: HashSet<ErrorCode>,
    /// Ceiling on the failed-attempt ledger; once reached no further offers
    /// are issued.
    pub max_attempts: u32,
    pub max_auto_fallbacks: u32,
    /// How long a pending offer waits for a user response.
    pub user_response_timeout: Duration,
    /// Grace period before an automatic fallback executes.
    pub auto_fallback_delay: Duration,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            mode: FallbackMode::Manual,
            provider_priority: Vec::new(),
            trigger_error_codes: [
                ErrorCode::ProviderUnavailable,
                ErrorCode::NetworkError,
                ErrorCode::Timeout,
            ]
            .into_iter()
            .collect(),
            blocked_error_codes: [
                ErrorCode::CardDeclined,
                ErrorCode::InsufficientFunds,
                ErrorCode::ExpiredCard,
            ]
            .into_iter()
            .collect(),
            max_attempts: 2,
            max_auto_fallbacks: 1,
            user_response_timeout: Duration::from_secs(30),
            auto_fallback_delay: Duration::from_secs(3),
        }
    }
}

impl FallbackConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.provider_priority.is_empty() {
            return Err(ConfigError::EmptyProviderPriority);
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::ZeroMaxAttempts);
        }
        if self.user_response_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration {
                field: "user_response_timeout",
            });
        }
        if self.mode == FallbackMode::Auto && self.auto_fallback_delay.is_zero() {
            return Err(ConfigError::ZeroDuration {
                field: "auto_fallback_delay",
            });
        }
        Ok(())
    }
}

/// Eligibility policy: blocked codes always override trigger codes.
///
/// Pure over `(config, error)` — a definitive decline (e.g. `card_declined`)
/// must never be silently retried on another provider.
pub fn is_eligible_for_fallback(config: &FallbackConfig, error: &PaymentError) -> bool {
    if config.blocked_error_codes.contains(&error.code) {
        return false;
    }
    config.trigger_error_codes.contains(&error.code)
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FallbackStatus {
    #[default]
    Idle,
    Pending,
    Executing,
    AutoExecuting,
    Completed,
    Cancelled,
    Failed,
}

/// One entry of the append-only failed-attempt ledger.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FailedAttempt {
    pub provider_id: ProviderId,
    pub error: PaymentError,
    pub timestamp: chrono::DateTime<Utc>,
    pub was_auto_fallback: bool,
}

/// Orchestrator working state. The ledger is never pruned during a flow and
/// is cleared only on RESET.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FallbackState {
    pub status: FallbackStatus,
    pub pending_event: Option<FallbackAvailableEvent>,
    pub failed_attempts: Vec<FailedAttempt>,
    pub current_provider: Option<ProviderId>,
    pub is_auto_fallback: bool,
    pub original_request: Option<StartPaymentRequest>,
}

#[derive(Default)]
struct Timers {
    ttl: Option<JoinHandle<()>>,
    auto: Option<JoinHandle<()>>,
}

impl Timers {
    fn cancel_all(&mut self) {
        if let Some(handle) = self.ttl.take() {
            handle.abort();
        }
        if let Some(handle) = self.auto.take() {
            handle.abort();
        }
    }
}

/// Owns fallback policy and state for one flow machine.
pub struct FallbackOrchestrator {
    config: FallbackConfig,
    state: Mutex<FallbackState>,
    timers: Mutex<Timers>,
    /// Bumped by reset/abort/execution. Offer-opens carry the generation
    /// observed when their transition committed; a mismatch means the flow
    /// moved on while the snapshot sat in the pipeline, and the open is
    /// skipped instead of leaking a pending offer and an armed timer.
    generation: AtomicU64,
    /// Write-back channel into the flow machine.
    commands: mpsc::UnboundedSender<FlowEvent>,
    /// Outbound offers toward the caller/UI.
    offers: mpsc::UnboundedSender<FallbackAvailableEvent>,
}

impl FallbackOrchestrator {
    pub fn new(
        config: FallbackConfig,
        commands: mpsc::UnboundedSender<FlowEvent>,
        offers: mpsc::UnboundedSender<FallbackAvailableEvent>,
    ) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        Ok(Arc::new(Self {
            config,
            state: Mutex::new(FallbackState::default()),
            timers: Mutex::new(Timers::default()),
            generation: AtomicU64::new(0),
            commands,
            offers,
        }))
    }

    /// Current offer generation; read under the machine lock when a
    /// transition commits and checked again by [`Self::open_offer`].
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &FallbackConfig {
        &self.config
    }

    pub fn state(&self) -> FallbackState {
        self.lock_state().clone()
    }

    fn lock_state(&self) -> MutexGuard<'_, FallbackState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_timers(&self) -> MutexGuard<'_, Timers> {
        match self.timers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Providers the flow may still fall back to after `failed` failed with
    /// `error`. Empty when fallback must not be offered: ineligible code,
    /// ledger at `max_attempts`, or no providers left.
    pub fn eligible_alternatives(
        &self,
        failed: &ProviderId,
        error: &PaymentError,
    ) -> Vec<ProviderId> {
        if !is_eligible_for_fallback(&self.config, error) {
            return Vec::new();
        }
        let state = self.lock_state();
        if state.failed_attempts.len() as u32 >= self.config.max_attempts {
            debug!(
                attempts = state.failed_attempts.len(),
                "fallback attempts exhausted"
            );
            return Vec::new();
        }
        self.config
            .provider_priority
            .iter()
            .filter(|candidate| *candidate != failed)
            .filter(|candidate| {
                !state
                    .failed_attempts
                    .iter()
                    .any(|attempt| &attempt.provider_id == *candidate)
            })
            .cloned()
            .collect()
    }

    /// Open a fresh offer, superseding any pending one. The event id is
    /// supplied by the flow machine so its context and the offer agree;
    /// `generation` is the value of [`Self::generation`] when the
    /// `FallbackCandidate` transition committed. A reset, abort, or
    /// execution since then bumps the generation and makes this open a
    /// no-op, so an offer can never outlive the flow state it belongs to.
    /// Returns whether an offer was actually opened.
    pub fn open_offer(
        self: &Arc<Self>,
        generation: u64,
        event_id: Uuid,
        failed_provider: ProviderId,
        error: PaymentError,
        alternatives: Vec<ProviderId>,
        original_request: StartPaymentRequest,
    ) -> bool {
        if alternatives.is_empty() {
            debug!(%failed_provider, "no alternatives, not offering fallback");
            return false;
        }

        let event = FallbackAvailableEvent {
            event_id,
            failed_provider,
            error,
            alternative_providers: alternatives,
            original_request: original_request.clone(),
            timestamp: Utc::now(),
        };

        {
            let mut state = self.lock_state();
            if self.generation.load(Ordering::Acquire) != generation {
                debug!(%event_id, "skipping stale fallback offer, flow moved on");
                return false;
            }
            // A superseding offer invalidates the previous one and its
            // timers. Arming happens under the state lock so a concurrent
            // reset/abort cannot slip between the two.
            self.lock_timers().cancel_all();
            state.pending_event = Some(event.clone());
            state.status = FallbackStatus::Pending;
            state.is_auto_fallback = false;
            state.original_request = Some(original_request);

            let auto_eligible = self.config.mode == FallbackMode::Auto
                && (state.failed_attempts.len() as u32) < self.config.max_auto_fallbacks;
            if auto_eligible {
                self.arm_auto_timer(event_id);
            } else {
                self.arm_ttl_timer(event_id);
            }
        }

        counter!("payflow_fallback_offered_total", 1);
        info!(%event_id, "fallback offer opened");
        if self.offers.send(event).is_err() {
            debug!("offer receiver dropped, offer delivered to state only");
        }
        true
    }

    fn arm_ttl_timer(self: &Arc<Self>, event_id: Uuid) {
        let me = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(me.config.user_response_timeout).await;
            me.on_offer_expired(event_id);
        });
        if let Some(previous) = self.lock_timers().ttl.replace(handle) {
            previous.abort();
        }
    }

    fn arm_auto_timer(self: &Arc<Self>, event_id: Uuid) {
        let me = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(me.config.auto_fallback_delay).await;
            me.on_auto_delay_elapsed(event_id);
        });
        if let Some(previous) = self.lock_timers().auto.replace(handle) {
            previous.abort();
        }
    }

    fn on_offer_expired(&self, event_id: Uuid) {
        let mut state = self.lock_state();
        let matches = state
            .pending_event
            .as_ref()
            .map(|ev| ev.event_id == event_id)
            .unwrap_or(false);
        if !matches || state.status != FallbackStatus::Pending {
            return;
        }
        // Conservative default: silence is a decline.
        state.pending_event = None;
        state.status = FallbackStatus::Failed;
        counter!("payflow_fallback_expired_total", 1);
        warn!(%event_id, "fallback offer expired without a response");
    }

    fn on_auto_delay_elapsed(self: &Arc<Self>, event_id: Uuid) {
        let request = {
            let mut state = self.lock_state();
            let pending = match state.pending_event.as_ref() {
                Some(ev) if ev.event_id == event_id && state.status == FallbackStatus::Pending => {
                    ev.clone()
                }
                _ => return,
            };
            let Some(target) = pending.alternative_providers.first().cloned() else {
                return;
            };
            state.status = FallbackStatus::AutoExecuting;
            state.is_auto_fallback = true;
            pending.original_request.retargeted(target)
        };

        info!(%event_id, provider = %request.provider, "executing automatic fallback");
        self.send_execute(request);
    }

    /// Apply a user response to the pending offer. Responses for an unknown
    /// or superseded offer, or arriving when nothing is pending, are dropped
    /// with a log tag and never change state.
    pub fn handle_user_response(self: &Arc<Self>, response: FallbackUserResponse) {
        let request = {
            let mut state = self.lock_state();
            let Some(pending) = state.pending_event.clone() else {
                warn!(event_id = %response.event_id, reason = "expired",
                    "dropping fallback response with no pending offer");
                return;
            };
            if pending.event_id != response.event_id {
                warn!(event_id = %response.event_id, pending_id = %pending.event_id,
                    reason = "unknown_event", "dropping fallback response for unknown offer");
                return;
            }
            if state.status != FallbackStatus::Pending {
                warn!(event_id = %response.event_id, status = %state.status,
                    reason = "expired", "dropping fallback response, offer no longer pending");
                return;
            }

            self.lock_timers().cancel_all();

            if !response.accepted {
                state.pending_event = None;
                state.status = FallbackStatus::Cancelled;
                state.is_auto_fallback = false;
                info!(event_id = %response.event_id, "fallback offer declined");
                drop(state);
                self.send_event(FlowEvent::FallbackAbort);
                return;
            }

            let target = response
                .selected_provider
                .filter(|p| pending.alternative_providers.contains(p))
                .or_else(|| pending.alternative_providers.first().cloned());
            let Some(target) = target else {
                warn!(event_id = %response.event_id, "accepted offer has no usable provider");
                state.pending_event = None;
                state.status = FallbackStatus::Failed;
                return;
            };

            state.status = FallbackStatus::Executing;
            state.is_auto_fallback = false;
            pending.original_request.retargeted(target)
        };

        info!(provider = %request.provider, "executing fallback on user acceptance");
        self.send_execute(request);
    }

    fn send_execute(&self, request: StartPaymentRequest) {
        let target = request.provider.clone();
        self.send_event(FlowEvent::FallbackExecute { target, request });
    }

    fn send_event(&self, event: FlowEvent) {
        if self.commands.send(event).is_err() {
            warn!("flow machine command channel closed, dropping fallback event");
        }
    }

    /// Ledger append at the moment the machine actually re-enters `Starting`
    /// for the fallback attempt. Runs as a synchronous machine effect,
    /// ordered before the new start operation, so caller-issued
    /// `FALLBACK_EXECUTE` commands are recorded too and a fast-failing
    /// retry can never read a stale ledger.
    pub fn record_execution(&self, target: &ProviderId) {
        let mut state = self.lock_state();
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.lock_timers().cancel_all();
        let was_auto = state.status == FallbackStatus::AutoExecuting || state.is_auto_fallback;
        if let Some(pending) = state.pending_event.take() {
            state.failed_attempts.push(FailedAttempt {
                provider_id: pending.failed_provider,
                error: pending.error,
                timestamp: Utc::now(),
                was_auto_fallback: was_auto,
            });
        } else {
            debug!(%target, "fallback execution without a pending offer");
        }
        if state.status != FallbackStatus::AutoExecuting {
            state.status = FallbackStatus::Executing;
        }
        state.current_provider = Some(target.clone());
        counter!("payflow_fallback_executed_total", 1);
    }

    /// The flow failed terminally after a fallback attempt with no further
    /// offer possible.
    pub fn on_flow_failed(&self) {
        let mut state = self.lock_state();
        if matches!(
            state.status,
            FallbackStatus::Executing | FallbackStatus::AutoExecuting
        ) {
            state.status = FallbackStatus::Failed;
        }
    }

    /// The flow completed after a fallback attempt.
    pub fn on_flow_completed(&self) {
        let mut state = self.lock_state();
        if matches!(
            state.status,
            FallbackStatus::Executing | FallbackStatus::AutoExecuting
        ) {
            state.status = FallbackStatus::Completed;
        }
    }

    /// User aborted from the fallback-candidate state: cancel everything
    /// scheduled and close the offer. Bumps the generation so an offer-open
    /// still queued behind this abort becomes a no-op.
    pub fn abort(&self) {
        let mut state = self.lock_state();
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.lock_timers().cancel_all();
        if state.pending_event.is_some() || state.status == FallbackStatus::Pending {
            info!("fallback aborted");
        }
        state.pending_event = None;
        state.is_auto_fallback = false;
        state.status = FallbackStatus::Cancelled;
    }

    /// Total reset: timers cancelled, ledger and offer cleared. Bumps the
    /// generation so an offer-open still queued behind this reset becomes a
    /// no-op.
    pub fn reset(&self) {
        let mut state = self.lock_state();
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.lock_timers().cancel_all();
        *state = FallbackState::default();
    }
}

impl Drop for FallbackOrchestrator {
    fn drop(&mut self) {
        if let Ok(mut timers) = self.timers.lock() {
            timers.cancel_all();
        }
    }
}
