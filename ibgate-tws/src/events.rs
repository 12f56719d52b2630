//! Server events.
//!
//! Incoming messages are decoded into one flat event sum type instead of a
//! callback interface; consumers receive them over an mpsc channel and route
//! on the request id.

use crate::models::{Bar, ContractDetails};

/// A decoded server message.
#[derive(Debug, Clone, PartialEq)]
pub enum TwsEvent {
    /// First usable request/order id; signals the session is ready.
    NextValidId { order_id: i64 },
    /// Comma-separated list of accessible account codes.
    ManagedAccounts { accounts: String },
    /// Error or status notice. `req_id` < 0 means session-level.
    Error {
        req_id: i32,
        error_time: i64,
        code: i32,
        message: String,
    },
    /// One resolved contract (a request may produce several).
    ContractDetails {
        req_id: i32,
        details: Box<ContractDetails>,
    },
    /// End marker for a contract-details request.
    ContractDetailsEnd { req_id: i32 },
    /// A chunk of historical bars.
    HistoricalData { req_id: i32, bars: Vec<Bar> },
    /// End marker for a historical-data request.
    HistoricalDataEnd {
        req_id: i32,
        start: String,
        end: String,
    },
    /// Acknowledgment of a market-data-type change.
    MarketDataType {
        req_id: i32,
        market_data_type: i32,
    },
    /// The transport hit EOF or a fatal read error; no more events follow.
    ConnectionClosed,
    /// A message this client does not decode.
    Unknown { msg_id: i32 },
}
