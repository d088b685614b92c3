//! Daily closing prices from Alpha Vantage, used to fill the historical cache.

use crate::error::AppError;
use crate::services::market::BoxFuture;
use chrono::NaiveDate;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

const ALPHA_VANTAGE_URL: &str = "https://www.alphavantage.co/query";

/// Date -> close for one symbol.
pub type DailyCloses = BTreeMap<NaiveDate, Decimal>;

/// Source of historical daily closes.
pub trait DailyCloseFetcher: Send + Sync {
    fn daily_closes<'a>(&'a self, symbol: &'a str) -> BoxFuture<'a, Result<DailyCloses, AppError>>;
}

#[derive(Debug, Clone, Deserialize)]
struct TimeSeriesDailyResponse {
    #[serde(rename = "Time Series (Daily)")]
    time_series: Option<HashMap<String, DailyPoint>>,
    /// Present instead of data when the key is rate limited.
    #[serde(rename = "Note")]
    note: Option<String>,
    #[serde(rename = "Error Message")]
    error_message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct DailyPoint {
    #[serde(rename = "4. close")]
    close: String,
}

fn parse_daily_closes(body: &str) -> Result<DailyCloses, AppError> {
    let data: TimeSeriesDailyResponse = serde_json::from_str(body)?;

    if let Some(message) = data.error_message.or(data.note) {
        return Err(AppError::MarketData(message));
    }

    let time_series = data
        .time_series
        .ok_or_else(|| AppError::MarketData("No time series data available".to_string()))?;

    Ok(time_series
        .into_iter()
        .filter_map(|(date_str, point)| {
            let date = NaiveDate::parse_from_str(&date_str, "%Y-%m-%d").ok()?;
            let close: Decimal = point.close.trim().parse().ok()?;
            (close > Decimal::ZERO).then_some((date, close))
        })
        .collect())
}

/// Alpha Vantage `TIME_SERIES_DAILY` client.
pub struct AlphaVantageClient {
    client: Client,
    api_key: String,
    base_url: String,
}

impl AlphaVantageClient {
    pub fn new(api_key: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: ALPHA_VANTAGE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Full daily history for a symbol.
    pub async fn get_daily_closes(&self, symbol: &str) -> Result<DailyCloses, AppError> {
        let url = format!(
            "{}?function=TIME_SERIES_DAILY&symbol={}&outputsize=full&apikey={}",
            self.base_url, symbol, self.api_key
        );

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(AppError::MarketData(format!(
                "API error: {}",
                response.status()
            )));
        }

        let body = response.text().await?;
        let closes = parse_daily_closes(&body)?;
        debug!("Fetched {} daily closes for {}", closes.len(), symbol);
        Ok(closes)
    }
}

impl DailyCloseFetcher for AlphaVantageClient {
    fn daily_closes<'a>(&'a self, symbol: &'a str) -> BoxFuture<'a, Result<DailyCloses, AppError>> {
        Box::pin(self.get_daily_closes(symbol))
    }
}
