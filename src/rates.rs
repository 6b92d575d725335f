//! Currency Rate Provider
//!
//! USD valuations for withdrawal amounts. The live rate aggregator is an
//! external service; [`StaticRateProvider`] serves fixed prices from config.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use thiserror::Error;

pub const USD: &str = "USD";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RateError {
    #[error("Unknown rate source: {0}")]
    UnknownSource(String),

    #[error("No {currency} rate in source {source_name}")]
    UnknownRate {
        source_name: String,
        currency: String,
    },

    #[error("Zero {0} rate")]
    ZeroRate(String),
}

impl RateError {
    pub fn code(&self) -> &'static str {
        match self {
            RateError::UnknownSource(_) => "RATE_UNKNOWN_SOURCE",
            RateError::UnknownRate { .. } => "RATE_UNKNOWN",
            RateError::ZeroRate(_) => "RATE_ZERO",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvertParams<'a> {
    /// Rate source name, e.g. `binance`
    pub source: &'a str,
    pub from: &'a str,
    pub to: &'a str,
    pub amount: Decimal,
    /// `from` is pegged 1:1 to USD
    pub is_stable_coin: bool,
    /// Decimal places of the result, unrounded if `None`
    pub scale: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RatesList {
    pub currency_ids: Vec<String>,
    /// USD price, index-aligned with `currency_ids`
    pub rates: Vec<Decimal>,
}

#[async_trait]
pub trait CurrencyRateProvider: Send + Sync {
    async fn convert(&self, params: ConvertParams<'_>) -> Result<Decimal, RateError>;

    async fn load_rates_list(&self, source: &str) -> Result<RatesList, RateError>;
}

/// Fixed USD prices per source, keyed by currency code
#[derive(Debug, Clone, Default)]
pub struct StaticRateProvider {
    sources: HashMap<String, HashMap<String, Decimal>>,
    /// Used when a user has no rate source of their own
    default_source: Option<String>,
}

impl StaticRateProvider {
    pub fn new(sources: HashMap<String, HashMap<String, Decimal>>) -> Self {
        let sources = sources
            .into_iter()
            .map(|(name, prices)| {
                let prices = prices
                    .into_iter()
                    .map(|(code, price)| (code.to_uppercase(), price))
                    .collect();
                (name, prices)
            })
            .collect();
        Self {
            sources,
            default_source: None,
        }
    }

    pub fn with_default_source(mut self, source: &str) -> Self {
        self.default_source = Some(source.to_string());
        self
    }

    pub fn with_rate(mut self, source: &str, code: &str, usd_price: Decimal) -> Self {
        self.sources
            .entry(source.to_string())
            .or_default()
            .insert(code.to_uppercase(), usd_price);
        self
    }

    fn prices(&self, source: &str) -> Result<&HashMap<String, Decimal>, RateError> {
        let source = match (source, &self.default_source) {
            ("", Some(default)) => default.as_str(),
            _ => source,
        };
        self.sources
            .get(source)
            .ok_or_else(|| RateError::UnknownSource(source.to_string()))
    }

    fn usd_price(&self, source: &str, code: &str, is_stable_coin: bool) -> Result<Decimal, RateError> {
        let code = code.to_uppercase();
        if code == USD {
            return Ok(Decimal::ONE);
        }
        let prices = self.prices(source)?;
        match prices.get(&code) {
            Some(price) => Ok(*price),
            None if is_stable_coin => Ok(Decimal::ONE),
            None => Err(RateError::UnknownRate {
                source_name: source.to_string(),
                currency: code,
            }),
        }
    }
}

#[async_trait]
impl CurrencyRateProvider for StaticRateProvider {
    async fn convert(&self, params: ConvertParams<'_>) -> Result<Decimal, RateError> {
        let converted = if params.from.eq_ignore_ascii_case(params.to) {
            params.amount
        } else {
            let from = self.usd_price(params.source, params.from, params.is_stable_coin)?;
            let to = self.usd_price(params.source, params.to, false)?;
            if to.is_zero() {
                return Err(RateError::ZeroRate(params.to.to_uppercase()));
            }
            params.amount * from / to
        };

        Ok(match params.scale {
            Some(scale) => converted.round_dp(scale),
            None => converted,
        })
    }

    async fn load_rates_list(&self, source: &str) -> Result<RatesList, RateError> {
        let prices = self.prices(source)?;

        let mut entries: Vec<_> = prices.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));

        Ok(RatesList {
            currency_ids: entries.iter().map(|(code, _)| (*code).clone()).collect(),
            rates: entries.iter().map(|(_, price)| **price).collect(),
        })
    }
}
