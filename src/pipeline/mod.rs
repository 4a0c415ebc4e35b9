/*!
 * Snapshot pipeline.
 *
 * Ordered side-effect dispatcher invoked on every state transition:
 * telemetry, then persistence, then the fallback bridge, with no reordering
 * across transitions — snapshot N+1's effects never begin before N's
 * complete. Effects are keyed by transition, so redundant event deliveries
 * that do not change state produce no new side effects.
 */
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::events::{TelemetryEvent, TelemetryKind};
use crate::fallback::FallbackOrchestrator;
use crate::flow::{FlowState, PaymentFlowContext};
use crate::models::FlowId;

/// One state transition and the context that resulted from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSnapshot {
    /// Monotonic per-flow transition counter.
    pub seq: u64,
    pub flow_id: FlowId,
    pub from: FlowState,
    pub to: FlowState,
    /// Kind label of the event that caused the transition.
    pub trigger: String,
    pub context: PaymentFlowContext,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Error)]
#[error("telemetry sink error: {0}")]
pub struct TelemetryError(pub String);

#[derive(Debug, Error)]
#[error("snapshot store error: {0}")]
pub struct StoreError(pub String);

/// Telemetry sink contract. Must never block the flow; errors are swallowed
/// by the pipeline.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn record(&self, event: TelemetryEvent) -> Result<(), TelemetryError>;
}

/// Persistence contract: persist/restore flow context keyed by flow id.
/// Delivery is at-least-once; implementations may be no-ops.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn handle_snapshot(&self, snapshot: &FlowSnapshot) -> Result<(), StoreError>;
}

pub struct NoopTelemetrySink;

#[async_trait]
impl TelemetrySink for NoopTelemetrySink {
    async fn record(&self, _event: TelemetryEvent) -> Result<(), TelemetryError> {
        Ok(())
    }
}

pub struct NoopSnapshotStore;

#[async_trait]
impl SnapshotStore for NoopSnapshotStore {
    async fn handle_snapshot(&self, _snapshot: &FlowSnapshot) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Work items flowing from the machine to the pipeline worker, in emission
/// order.
#[derive(Debug)]
pub(crate) enum PipelineItem {
    Telemetry(TelemetryEvent),
    Snapshot {
        snapshot: Box<FlowSnapshot>,
        /// Orchestrator generation observed when the transition committed;
        /// the bridge hands it to `open_offer` so an offer cannot be opened
        /// for a flow that has since been reset, aborted, or re-entered.
        offer_generation: u64,
    },
}

pub(crate) struct SnapshotPipeline;

impl SnapshotPipeline {
    /// Single worker draining the channel sequentially; ordering across
    /// transitions follows from processing one item at a time.
    pub(crate) fn spawn(
        mut rx: mpsc::UnboundedReceiver<PipelineItem>,
        telemetry: Arc<dyn TelemetrySink>,
        store: Arc<dyn SnapshotStore>,
        fallback: Arc<FallbackOrchestrator>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                match item {
                    PipelineItem::Telemetry(event) => {
                        record_swallowing(&*telemetry, event).await;
                    }
                    PipelineItem::Snapshot {
                        snapshot,
                        offer_generation,
                    } => {
                        Self::handle_snapshot(
                            &*telemetry,
                            &*store,
                            &fallback,
                            &snapshot,
                            offer_generation,
                        )
                        .await;
                    }
                }
            }
            debug!("snapshot pipeline drained");
        })
    }

    async fn handle_snapshot(
        telemetry: &dyn TelemetrySink,
        store: &dyn SnapshotStore,
        fallback: &Arc<FallbackOrchestrator>,
        snapshot: &FlowSnapshot,
        offer_generation: u64,
    ) {
        counter!("payflow_snapshots_total", 1);

        // 1. Telemetry
        let event = TelemetryEvent::now(TelemetryKind::StateChanged, snapshot.flow_id)
            .with_transition(snapshot.from.label(), snapshot.to.label())
            .with_trigger(snapshot.trigger.clone())
            .with_provider(snapshot.context.provider.clone());
        record_swallowing(telemetry, event).await;

        // 2. Persistence (at-least-once, errors logged)
        match store.handle_snapshot(snapshot).await {
            Ok(()) => {
                let event =
                    TelemetryEvent::now(TelemetryKind::SnapshotPersisted, snapshot.flow_id)
                        .with_trigger(snapshot.trigger.clone());
                record_swallowing(telemetry, event).await;
            }
            Err(err) => {
                counter!("payflow_snapshot_store_errors_total", 1);
                warn!(flow_id = %snapshot.flow_id, seq = snapshot.seq, %err,
                    "snapshot persistence failed");
            }
        }

        // 3. Fallback bridge
        Self::bridge(telemetry, fallback, snapshot, offer_generation).await;
    }

    async fn bridge(
        telemetry: &dyn TelemetrySink,
        fallback: &Arc<FallbackOrchestrator>,
        snapshot: &FlowSnapshot,
        offer_generation: u64,
    ) {
        let ctx = &snapshot.context;
        match snapshot.to {
            FlowState::FallbackCandidate => {
                let (Some(event_id), Some(from), Some(error), Some(request)) = (
                    ctx.fallback_event_id,
                    ctx.fallback_from.clone(),
                    ctx.last_error.clone(),
                    ctx.start_request.clone(),
                ) else {
                    warn!(flow_id = %snapshot.flow_id,
                        "fallback candidate snapshot missing offer fields");
                    return;
                };
                let opened = fallback.open_offer(
                    offer_generation,
                    event_id,
                    from,
                    error,
                    ctx.fallback_candidates.clone(),
                    request,
                );
                if opened {
                    let event =
                        TelemetryEvent::now(TelemetryKind::FallbackOffered, snapshot.flow_id)
                            .with_provider(ctx.provider.clone());
                    record_swallowing(telemetry, event).await;
                }
            }
            // The ledger append itself runs synchronously with the
            // machine's FALLBACK_EXECUTE handling; only telemetry is late.
            FlowState::Starting if snapshot.trigger == "fallback_execute" => {
                let event = TelemetryEvent::now(TelemetryKind::FallbackExecuted, snapshot.flow_id)
                    .with_provider(ctx.provider.clone());
                record_swallowing(telemetry, event).await;
            }
            FlowState::Done => {
                fallback.on_flow_completed();
            }
            FlowState::Failed => {
                fallback.on_flow_failed();
            }
            _ => {}
        }
    }
}

async fn record_swallowing(telemetry: &dyn TelemetrySink, event: TelemetryEvent) {
    if let Err(err) = telemetry.record(event).await {
        // Telemetry must never fail the flow.
        debug!(%err, "telemetry sink error swallowed");
    }
}
