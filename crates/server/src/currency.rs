//! Exchange-rate lookups against an `exchangerate-api`-style HTTP service.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use expensa_core::config::CurrencyConfig;
use expensa_core::currency::{ConversionError, CurrencyConverter};
use reqwest::Client;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
#[error("could not build exchange-rate http client: {0}")]
pub struct ExchangeRateError(#[source] reqwest::Error);

#[derive(Debug, Deserialize)]
struct LatestRates {
    rates: BTreeMap<String, Decimal>,
}

pub struct ExchangeRateClient {
    client: Client,
    base_url: String,
    api_key: Option<SecretString>,
    timeout_secs: u64,
}

impl ExchangeRateClient {
    pub fn new(config: &CurrencyConfig) -> Result<Self, ExchangeRateError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(ExchangeRateError)?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            timeout_secs: config.timeout_secs,
        })
    }

    fn map_transport(&self, error: reqwest::Error) -> ConversionError {
        if error.is_timeout() {
            ConversionError::Timeout(self.timeout_secs)
        } else {
            ConversionError::Unavailable(error.to_string())
        }
    }
}

#[async_trait]
impl CurrencyConverter for ExchangeRateClient {
    async fn rate(&self, from: &str, to: &str) -> Result<Decimal, ConversionError> {
        let from = from.to_ascii_uppercase();
        let to = to.to_ascii_uppercase();
        let url = format!("{}/latest/{from}", self.base_url);

        let mut request = self.client.get(&url);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key.expose_secret());
        }

        let response = request.send().await.map_err(|error| self.map_transport(error))?;
        if !response.status().is_success() {
            return Err(ConversionError::Unavailable(format!(
                "rate endpoint returned {}",
                response.status()
            )));
        }

        let latest: LatestRates = response
            .json()
            .await
            .map_err(|error| ConversionError::InvalidResponse(error.to_string()))?;
        debug!(from = %from, to = %to, rates = latest.rates.len(), "exchange rates fetched");

        latest.rates.get(&to).copied().ok_or(ConversionError::UnknownRate { from, to })
    }
}

/// Used when lookups are switched off; every cross-currency expense keeps
/// its original amount.
#[derive(Clone, Copy, Debug, Default)]
pub struct DisabledConverter;

#[async_trait]
impl CurrencyConverter for DisabledConverter {
    async fn rate(&self, _from: &str, _to: &str) -> Result<Decimal, ConversionError> {
        Err(ConversionError::Unavailable("currency conversion is disabled".to_string()))
    }
}

pub fn converter_from_config(
    config: &CurrencyConfig,
) -> Result<Arc<dyn CurrencyConverter>, ExchangeRateError> {
    if !config.enabled {
        return Ok(Arc::new(DisabledConverter));
    }
    Ok(Arc::new(ExchangeRateClient::new(config)?))
}
