//! JSON response shapes for the HTTP API.
//!
//! Wire-side types stay in ibgate-tws; these are the flattened, camelCase
//! views the HTTP clients see. Decimal volumes become plain JSON numbers
//! here, lossy is fine at chart resolution.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;

use ibgate_tws::{Bar, ContractDetails};

use crate::products::ProductSpec;

/// Identifying slice of a resolved contract.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractSummary {
    pub con_id: i64,
    pub symbol: String,
    pub local_symbol: String,
    pub sec_type: String,
    pub exchange: String,
    pub currency: String,
    pub last_trade_date: String,
}

impl From<&ContractDetails> for ContractSummary {
    fn from(details: &ContractDetails) -> Self {
        let c = &details.contract;
        Self {
            con_id: c.con_id,
            symbol: c.symbol.clone(),
            local_symbol: c.local_symbol.clone(),
            sec_type: c.sec_type.clone(),
            exchange: c.exchange.clone(),
            currency: c.currency.clone(),
            last_trade_date: c.last_trade_date_or_contract_month.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoricalBar {
    pub time: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wap: Option<f64>,
    pub count: i32,
}

impl From<&Bar> for HistoricalBar {
    fn from(bar: &Bar) -> Self {
        Self {
            time: bar.time.clone(),
            open: bar.open,
            high: bar.high,
            low: bar.low,
            close: bar.close,
            volume: bar.volume.as_ref().and_then(|v| v.to_f64()),
            wap: bar.wap.as_ref().and_then(|v| v.to_f64()),
            count: bar.count,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketDataResponse {
    pub symbol: String,
    pub contract: ContractSummary,
    pub duration: String,
    pub bar_size: String,
    pub what_to_show: String,
    pub count: usize,
    pub data: Vec<HistoricalBar>,
    pub request_time: DateTime<Utc>,
    pub response_time: DateTime<Utc>,
    pub duration_ms: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractDetailsResponse {
    pub symbol: String,
    pub count: usize,
    pub contracts: Vec<ContractDetails>,
    pub request_time: DateTime<Utc>,
    pub response_time: DateTime<Utc>,
    pub duration_ms: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductInfo {
    pub code: String,
    pub symbol: String,
    pub sec_type: String,
    pub exchange: String,
    pub currency: String,
    pub description: String,
}

impl From<&ProductSpec> for ProductInfo {
    fn from(spec: &ProductSpec) -> Self {
        Self {
            code: spec.code.to_string(),
            symbol: spec.symbol.to_string(),
            sec_type: spec.sec_type.to_string(),
            exchange: spec.exchange.to_string(),
            currency: spec.currency.to_string(),
            description: spec.description.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductsResponse {
    pub count: usize,
    pub products: Vec<ProductInfo>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub connected: bool,
    pub ready: bool,
    pub host: String,
    pub port: u16,
    pub client_id: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectResponse {
    pub status: String,
    pub message: String,
    pub client_id: i32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            symbol: None,
            timestamp: Utc::now(),
        }
    }

    pub fn for_symbol(error: impl Into<String>, symbol: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            symbol: Some(symbol.into()),
            timestamp: Utc::now(),
        }
    }
}
