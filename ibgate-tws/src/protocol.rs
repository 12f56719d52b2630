//! Wire protocol constants for the IB TWS API.
//!
//! Message IDs and server-version gates follow the official API definitions.
//! Only the messages this crate actually sends or decodes are listed.

/// Lowest server version this client will talk to (V100+ framing baseline).
pub const MIN_CLIENT_VER: i32 = 100;

/// Highest server version this client advertises.
///
/// Capped one below the protobuf threshold (201): everything up to here uses
/// the null-terminated ASCII field format on both directions.
pub const MAX_CLIENT_VER: i32 = 200;

/// Length of the big-endian message length prefix.
pub const HEADER_LEN: usize = 4;

/// Maximum allowed message body length (0xFFFFFF).
pub const MAX_MSG_LEN: usize = 0xFF_FFFF;

/// Magic prefix of the V100+ connect request.
pub const API_SIGN: &[u8] = b"API\0";

/// Incoming (server → client) message IDs.
pub mod incoming {
    pub const ERR_MSG: i32 = 4;
    pub const NEXT_VALID_ID: i32 = 9;
    pub const CONTRACT_DATA: i32 = 10;
    pub const MANAGED_ACCTS: i32 = 15;
    pub const HISTORICAL_DATA: i32 = 17;
    pub const CONTRACT_DATA_END: i32 = 52;
    pub const MARKET_DATA_TYPE: i32 = 58;
    pub const HISTORICAL_DATA_END: i32 = 108;
}

/// Outgoing (client → server) message IDs.
pub mod outgoing {
    pub const REQ_CONTRACT_DATA: i32 = 9;
    pub const REQ_HISTORICAL_DATA: i32 = 20;
    pub const REQ_MARKET_DATA_TYPE: i32 = 59;
    pub const START_API: i32 = 71;
}

/// Server-version feature gates (`MIN_SERVER_VER_*` in the official API).
pub mod server_version {
    pub const CONTRACT_DATA_CHAIN: i32 = 40;
    pub const SEC_ID_TYPE: i32 = 45;
    pub const REQ_MARKET_DATA_TYPE: i32 = 55;
    pub const TRADING_CLASS: i32 = 68;
    pub const LINKING: i32 = 70;
    pub const OPTIONAL_CAPABILITIES: i32 = 72;
    pub const PRIMARYEXCH: i32 = 75;
    pub const MD_SIZE_MULTIPLIER: i32 = 110;
    pub const AGG_GROUP: i32 = 121;
    pub const UNDERLYING_INFO: i32 = 122;
    pub const SYNT_REALTIME_BARS: i32 = 124;
    pub const MARKET_RULES: i32 = 126;
    pub const REAL_EXPIRATION_DATE: i32 = 134;
    pub const STOCK_TYPE: i32 = 152;
    pub const FRACTIONAL_SIZE_SUPPORT: i32 = 163;
    pub const SIZE_RULES: i32 = 164;
    pub const ADVANCED_ORDER_REJECT: i32 = 166;
    pub const BOND_ISSUERID: i32 = 176;
    pub const FUND_DATA_FIELDS: i32 = 179;
    pub const LAST_TRADE_DATE: i32 = 182;
    pub const INELIGIBILITY_REASONS: i32 = 186;
    pub const ERROR_TIME: i32 = 194;
    pub const HISTORICAL_DATA_END: i32 = 196;
    pub const PROTOBUF: i32 = 201;
}
