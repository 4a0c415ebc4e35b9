use serde::{Deserialize, Serialize};

use crate::models::ActionKind;

/// The flow machine's state, modeled as data so transitions stay
/// exhaustively checkable. `RequiresAction` is hierarchical: its sub-state
/// is the [`ActionKind`] selected by the provider's `next_action`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "sub", rename_all = "snake_case")]
pub enum FlowState {
    Idle,
    Starting,
    RequiresAction(ActionKind),
    Confirming,
    FetchingStatus,
    Finalizing,
    Reconciling,
    Cancelling,
    Failed,
    /// Quasi-terminal: a fallback offer is on the table.
    FallbackCandidate,
    Done,
}

impl FlowState {
    /// States with a provider operation or external step in flight.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            FlowState::Starting
                | FlowState::RequiresAction(_)
                | FlowState::Confirming
                | FlowState::FetchingStatus
                | FlowState::Finalizing
                | FlowState::Reconciling
                | FlowState::Cancelling
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FlowState::Failed | FlowState::FallbackCandidate | FlowState::Done
        )
    }

    /// Stable label for snapshots, telemetry and logs.
    pub fn label(&self) -> &'static str {
        match self {
            FlowState::Idle => "idle",
            FlowState::Starting => "starting",
            FlowState::RequiresAction(ActionKind::Redirect) => "requires_action.redirect",
            FlowState::RequiresAction(ActionKind::ClientConfirm) => {
                "requires_action.client_confirm"
            }
            FlowState::RequiresAction(ActionKind::ManualStep) => "requires_action.manual_step",
            FlowState::RequiresAction(ActionKind::ExternalWait) => "requires_action.external_wait",
            FlowState::Confirming => "confirming",
            FlowState::FetchingStatus => "fetching_status",
            FlowState::Finalizing => "finalizing",
            FlowState::Reconciling => "reconciling",
            FlowState::Cancelling => "cancelling",
            FlowState::Failed => "failed",
            FlowState::FallbackCandidate => "fallback_candidate",
            FlowState::Done => "done",
        }
    }
}
