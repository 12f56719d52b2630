//! Wire-level data models: contracts, contract details, historical bars.
//!
//! Trimmed to the fields the gateway serves. Security type, right and the
//! various date fields stay plain strings, as the wire carries them.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A tradeable instrument description, as sent in request messages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Contract {
    pub con_id: i64,
    pub symbol: String,
    /// Security type: "STK", "FUT", "CONTFUT", ...
    pub sec_type: String,
    pub last_trade_date_or_contract_month: String,
    pub last_trade_date: String,
    pub strike: Option<f64>,
    pub right: String,
    pub multiplier: String,
    pub exchange: String,
    pub primary_exchange: String,
    pub currency: String,
    pub local_symbol: String,
    pub trading_class: String,
    pub include_expired: bool,
    pub sec_id_type: String,
    pub sec_id: String,
    pub issuer_id: String,
}

/// Full contract description returned by a contract-details request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContractDetails {
    pub contract: Contract,
    pub market_name: String,
    pub min_tick: f64,
    pub order_types: String,
    pub valid_exchanges: String,
    pub price_magnifier: i64,
    pub under_con_id: i32,
    pub long_name: String,
    pub contract_month: String,
    pub industry: String,
    pub category: String,
    pub subcategory: String,
    pub time_zone_id: String,
    pub trading_hours: String,
    pub liquid_hours: String,
    pub ev_rule: String,
    pub ev_multiplier: f64,
    pub agg_group: Option<i32>,
    pub under_symbol: String,
    pub under_sec_type: String,
    pub market_rule_ids: String,
    pub real_expiration_date: String,
    pub stock_type: String,
    pub min_size: Option<Decimal>,
    pub size_increment: Option<Decimal>,
    pub suggested_size_increment: Option<Decimal>,
}

/// A single historical data bar.
///
/// `volume` and `wap` are `None` when the server sends the unset sentinel
/// (empty field). `time` keeps the server's formatted string.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Bar {
    pub time: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: Option<Decimal>,
    pub wap: Option<Decimal>,
    pub count: i32,
}
