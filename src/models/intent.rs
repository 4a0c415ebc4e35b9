use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use strum::{Display, EnumString};

use super::ids::{IntentId, ProviderId};
use super::money::Money;

/// Provider-reported lifecycle status of a payment intent.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum IntentStatus {
    RequiresPaymentMethod,
    RequiresConfirmation,
    RequiresAction,
    Processing,
    Succeeded,
    Failed,
    Canceled,
}

impl IntentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IntentStatus::Succeeded | IntentStatus::Failed | IntentStatus::Canceled
        )
    }
}

/// Follow-up the provider requires before the payment can settle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NextAction {
    Redirect {
        url: String,
    },
    ClientConfirm {
        token: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        return_url: Option<String>,
    },
    ManualStep {
        instructions: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },
    ExternalWait {
        #[serde(skip_serializing_if = "Option::is_none")]
        hint: Option<String>,
    },
}

impl NextAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            NextAction::Redirect { .. } => ActionKind::Redirect,
            NextAction::ClientConfirm { .. } => ActionKind::ClientConfirm,
            NextAction::ManualStep { .. } => ActionKind::ManualStep,
            NextAction::ExternalWait { .. } => ActionKind::ExternalWait,
        }
    }
}

/// Discriminant of [`NextAction`]; selects the `RequiresAction` sub-state.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ActionKind {
    Redirect,
    ClientConfirm,
    ManualStep,
    ExternalWait,
}

/// Result of a provider operation.
///
/// Immutable once returned: later operations supersede it with a new value,
/// nothing mutates an existing one. `raw` carries the provider payload for
/// diagnostics only and takes no part in flow decisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: IntentId,
    pub provider: ProviderId,
    pub status: IntentStatus,
    pub amount: Money,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_action: Option<NextAction>,
    /// Opaque provider correlation keys (e.g. charge id, session id).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub provider_refs: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
}

impl PaymentIntent {
    /// The correlation reference for this intent: an explicit `reference_id`
    /// provider ref when present, the intent id otherwise.
    pub fn reference_id(&self) -> &str {
        self.provider_refs
            .get("reference_id")
            .map(String::as_str)
            .unwrap_or_else(|| self.id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn intent(status: IntentStatus) -> PaymentIntent {
        PaymentIntent {
            id: IntentId::new("pi_test").unwrap(),
            provider: ProviderId::new("stripe").unwrap(),
            status,
            amount: Money::new(dec!(25.00), "USD").unwrap(),
            next_action: None,
            provider_refs: BTreeMap::new(),
            raw: None,
        }
    }

    #[test]
    fn next_action_serializes_with_kind_tag() {
        let action = NextAction::Redirect {
            url: "https://pay.example/redirect".into(),
        };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["kind"], "redirect");
        assert_eq!(action.kind(), ActionKind::Redirect);
    }

    #[test]
    fn reference_id_prefers_explicit_provider_ref() {
        let mut with_ref = intent(IntentStatus::Processing);
        with_ref
            .provider_refs
            .insert("reference_id".into(), "ref_42".into());
        assert_eq!(with_ref.reference_id(), "ref_42");
        assert_eq!(intent(IntentStatus::Processing).reference_id(), "pi_test");
    }

    #[test]
    fn terminal_statuses() {
        assert!(IntentStatus::Succeeded.is_terminal());
        assert!(IntentStatus::Canceled.is_terminal());
        assert!(!IntentStatus::Processing.is_terminal());
    }
}
