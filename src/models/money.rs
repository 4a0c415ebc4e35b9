use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::Violation;

/// ISO-4217-shaped currency code: exactly three ASCII uppercase letters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CurrencyCode([u8; 3]);

impl CurrencyCode {
    pub fn new(code: &str) -> Result<Self, Violation> {
        let bytes = code.as_bytes();
        if bytes.len() != 3 || !bytes.iter().all(|b| b.is_ascii_uppercase()) {
            return Err(Violation::InvalidCurrency(code.to_string()));
        }
        Ok(Self([bytes[0], bytes[1], bytes[2]]))
    }

    pub fn as_str(&self) -> &str {
        // Constructor admits ASCII uppercase only.
        std::str::from_utf8(&self.0).unwrap_or("???")
    }
}

impl fmt::Display for CurrencyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for CurrencyCode {
    type Error = Violation;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<CurrencyCode> for String {
    fn from(code: CurrencyCode) -> Self {
        code.as_str().to_string()
    }
}

/// A non-negative monetary amount in a single currency.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Money {
    pub amount: Decimal,
    pub currency: CurrencyCode,
}

impl Money {
    pub fn new(amount: Decimal, currency: &str) -> Result<Self, Violation> {
        if amount.is_sign_negative() && !amount.is_zero() {
            return Err(Violation::NegativeAmount);
        }
        Ok(Self {
            amount,
            currency: CurrencyCode::new(currency)?,
        })
    }

    pub fn is_zero(&self) -> bool {
        self.amount.is_zero()
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount, self.currency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn money_rejects_negative_amounts() {
        assert!(Money::new(dec!(10.50), "USD").is_ok());
        assert!(Money::new(dec!(0), "EUR").is_ok());
        assert_eq!(
            Money::new(dec!(-0.01), "USD"),
            Err(Violation::NegativeAmount)
        );
    }

    #[test]
    fn currency_must_be_three_uppercase_letters() {
        assert!(CurrencyCode::new("GBP").is_ok());
        assert!(matches!(
            CurrencyCode::new("usd"),
            Err(Violation::InvalidCurrency(_))
        ));
        assert!(matches!(
            CurrencyCode::new("EURO"),
            Err(Violation::InvalidCurrency(_))
        ));
    }

    #[test]
    fn currency_survives_serde_round_trip() {
        let money = Money::new(dec!(99.99), "USD").unwrap();
        let json = serde_json::to_string(&money).unwrap();
        assert!(json.contains("\"USD\""));
        let back: Money = serde_json::from_str(&json).unwrap();
        assert_eq!(back, money);
    }
}
