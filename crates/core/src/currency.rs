use std::collections::BTreeMap;

use async_trait::async_trait;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConversionError {
    #[error("no exchange rate from {from} to {to}")]
    UnknownRate { from: String, to: String },
    #[error("exchange-rate service unavailable: {0}")]
    Unavailable(String),
    #[error("exchange-rate service timed out after {0}s")]
    Timeout(u64),
    #[error("exchange-rate response could not be read: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait CurrencyConverter: Send + Sync {
    /// Returns the rate that turns one unit of `from` into `to`.
    async fn rate(&self, from: &str, to: &str) -> Result<Decimal, ConversionError>;
}

/// Result of normalizing an amount into a company's base currency.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversion {
    pub amount: Decimal,
    pub rate: Option<Decimal>,
    /// Present when the original amount was kept because conversion failed.
    pub fallback_reason: Option<String>,
}

impl Conversion {
    pub fn is_fallback(&self) -> bool {
        self.fallback_reason.is_some()
    }
}

/// Converts `amount` into `to`, keeping the original amount when the
/// converter fails. Failures never propagate.
pub async fn convert_with_fallback<C>(
    converter: &C,
    amount: Decimal,
    from: &str,
    to: &str,
) -> Conversion
where
    C: CurrencyConverter + ?Sized,
{
    if from.eq_ignore_ascii_case(to) {
        return Conversion { amount, rate: Some(Decimal::ONE), fallback_reason: None };
    }

    match converter.rate(from, to).await {
        Ok(rate) => Conversion {
            amount: (amount * rate).round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero),
            rate: Some(rate),
            fallback_reason: None,
        },
        Err(error) => Conversion { amount, rate: None, fallback_reason: Some(error.to_string()) },
    }
}

/// Fixed rate table, keyed by `(from, to)` currency codes.
#[derive(Clone, Debug, Default)]
pub struct StaticRateConverter {
    rates: BTreeMap<(String, String), Decimal>,
}

impl StaticRateConverter {
    pub fn with_rate(mut self, from: &str, to: &str, rate: Decimal) -> Self {
        self.rates.insert((from.to_ascii_uppercase(), to.to_ascii_uppercase()), rate);
        self
    }
}

#[async_trait]
impl CurrencyConverter for StaticRateConverter {
    async fn rate(&self, from: &str, to: &str) -> Result<Decimal, ConversionError> {
        let key = (from.to_ascii_uppercase(), to.to_ascii_uppercase());
        if let Some(rate) = self.rates.get(&key) {
            return Ok(*rate);
        }
        if let Some(inverse) = self.rates.get(&(key.1.clone(), key.0.clone())) {
            if !inverse.is_zero() {
                return Ok(Decimal::ONE / inverse);
            }
        }
        Err(ConversionError::UnknownRate { from: key.0, to: key.1 })
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::{convert_with_fallback, StaticRateConverter};

    #[tokio::test]
    async fn converts_with_known_rate_and_rounds_to_cents() {
        let converter = StaticRateConverter::default().with_rate("EUR", "USD", Decimal::new(1_085, 3));

        let conversion =
            convert_with_fallback(&converter, Decimal::new(10_005, 2), "eur", "USD").await;
        assert_eq!(conversion.amount, Decimal::new(10_855, 2));
        assert!(!conversion.is_fallback());
    }

    #[tokio::test]
    async fn missing_rate_falls_back_to_original_amount() {
        let converter = StaticRateConverter::default();

        let conversion = convert_with_fallback(&converter, Decimal::new(420, 0), "INR", "USD").await;
        assert_eq!(conversion.amount, Decimal::new(420, 0));
        assert!(conversion.is_fallback());
        assert!(conversion.fallback_reason.as_deref().is_some_and(|r| r.contains("INR")));
    }

    #[tokio::test]
    async fn same_currency_is_identity() {
        let conversion = convert_with_fallback(
            &StaticRateConverter::default(),
            Decimal::new(99, 0),
            "usd",
            "USD",
        )
        .await;
        assert_eq!(conversion.rate, Some(Decimal::ONE));
        assert_eq!(conversion.amount, Decimal::new(99, 0));
    }

    #[tokio::test]
    async fn inverse_rate_is_used_when_direct_is_missing() {
        let converter = StaticRateConverter::default().with_rate("USD", "EUR", Decimal::new(5, 1));
        let conversion = convert_with_fallback(&converter, Decimal::new(10, 0), "EUR", "USD").await;
        assert_eq!(conversion.amount, Decimal::new(2_000, 2));
    }
}
