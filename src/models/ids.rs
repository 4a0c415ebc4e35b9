use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::errors::Violation;

fn require_non_empty(field: &'static str, value: &str) -> Result<(), Violation> {
    if value.trim().is_empty() {
        Err(Violation::Empty { field })
    } else {
        Ok(())
    }
}

/// Identifier of a payment provider, e.g. `stripe` or `paypal`.
///
/// Lowercase alphanumerics plus `_`/`-`; doubles as the lookup key in the
/// normalizer and gateway registries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderId(String);

impl ProviderId {
    pub fn new(value: impl Into<String>) -> Result<Self, Violation> {
        let value = value.into();
        require_non_empty("provider_id", &value)?;
        if !value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
        {
            return Err(Violation::Malformed {
                field: "provider_id",
                value,
            });
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Merchant-side order identifier the payment is taken for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(String);

impl OrderId {
    pub fn new(value: impl Into<String>) -> Result<Self, Violation> {
        let value = value.into();
        require_non_empty("order_id", &value)?;
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Provider-issued payment intent identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IntentId(String);

impl IntentId {
    pub fn new(value: impl Into<String>) -> Result<Self, Violation> {
        let value = value.into();
        require_non_empty("intent_id", &value)?;
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IntentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of one flow machine instance; the storage key for snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowId(Uuid);

impl FlowId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_id_rejects_uppercase_and_empty() {
        assert!(ProviderId::new("stripe").is_ok());
        assert!(ProviderId::new("adyen-checkout").is_ok());
        assert!(matches!(
            ProviderId::new("Stripe"),
            Err(Violation::Malformed { .. })
        ));
        assert!(matches!(
            ProviderId::new("  "),
            Err(Violation::Empty { .. })
        ));
    }

    #[test]
    fn order_and_intent_ids_require_content() {
        assert!(OrderId::new("ord_123").is_ok());
        assert!(IntentId::new("pi_1").is_ok());
        assert!(OrderId::new("").is_err());
        assert!(IntentId::new("").is_err());
    }
}
