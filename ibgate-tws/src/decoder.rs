//! Incoming message decoder.
//!
//! Parses null-terminated ASCII fields from a message body with a cursor,
//! then dispatches per message id into a [`TwsEvent`]. Field orders and
//! server-version gates follow the official API's `EDecoder`. Fields the
//! gateway does not serve are consumed and dropped so the cursor stays
//! aligned.

use rust_decimal::Decimal;
use std::str::FromStr;

use crate::errors::{Result, TwsError};
use crate::events::TwsEvent;
use crate::models::{Bar, ContractDetails};
use crate::protocol::{incoming, server_version};

/// Decodes wire-format fields from a message body (without the length header).
///
/// Tracks the current read position; each `decode_*` reads the next field up
/// to its null terminator and advances past it.
pub struct MessageDecoder<'a> {
    data: &'a [u8],
    pos: usize,
    server_version: i32,
}

impl<'a> MessageDecoder<'a> {
    pub fn new(data: &'a [u8], server_version: i32) -> Self {
        Self {
            data,
            pos: 0,
            server_version,
        }
    }

    pub fn server_version(&self) -> i32 {
        self.server_version
    }

    pub fn has_remaining(&self) -> bool {
        self.pos < self.data.len()
    }

    fn find_field_end(&self) -> Result<usize> {
        self.data[self.pos..]
            .iter()
            .position(|&b| b == 0)
            .map(|offset| self.pos + offset)
            .ok_or_else(|| TwsError::Decoding("field not null-terminated".into()))
    }

    fn read_field_str(&mut self) -> Result<&'a str> {
        if !self.has_remaining() {
            return Err(TwsError::Decoding("unexpected end of message".into()));
        }
        let end = self.find_field_end()?;
        let field = std::str::from_utf8(&self.data[self.pos..end])
            .map_err(|e| TwsError::Decoding(format!("invalid UTF-8: {e}")))?;
        self.pos = end + 1;
        Ok(field)
    }

    pub fn decode_string(&mut self) -> Result<String> {
        self.read_field_str().map(|s| s.to_string())
    }

    /// Empty string decodes to 0, matching the server's `atoi` semantics.
    pub fn decode_i32(&mut self) -> Result<i32> {
        let s = self.read_field_str()?;
        if s.is_empty() {
            return Ok(0);
        }
        s.parse::<i32>()
            .map_err(|e| TwsError::Decoding(format!("invalid i32 '{s}': {e}")))
    }

    pub fn decode_i64(&mut self) -> Result<i64> {
        let s = self.read_field_str()?;
        if s.is_empty() {
            return Ok(0);
        }
        s.parse::<i64>()
            .map_err(|e| TwsError::Decoding(format!("invalid i64 '{s}': {e}")))
    }

    /// Handles the "Infinity" sentinel; empty string decodes to 0.0.
    pub fn decode_f64(&mut self) -> Result<f64> {
        let s = self.read_field_str()?;
        if s.is_empty() {
            return Ok(0.0);
        }
        if s == "Infinity" {
            return Ok(f64::INFINITY);
        }
        s.parse::<f64>()
            .map_err(|e| TwsError::Decoding(format!("invalid f64 '{s}': {e}")))
    }

    pub fn decode_bool(&mut self) -> Result<bool> {
        self.decode_i32().map(|v| v > 0)
    }

    /// Empty string → None (the wire's UNSET sentinel).
    pub fn decode_i32_max(&mut self) -> Result<Option<i32>> {
        let s = self.read_field_str()?;
        if s.is_empty() {
            return Ok(None);
        }
        s.parse::<i32>()
            .map(Some)
            .map_err(|e| TwsError::Decoding(format!("invalid i32 '{s}': {e}")))
    }

    /// Empty string → None.
    pub fn decode_f64_max(&mut self) -> Result<Option<f64>> {
        let s = self.read_field_str()?;
        if s.is_empty() {
            return Ok(None);
        }
        if s == "Infinity" {
            return Ok(Some(f64::INFINITY));
        }
        s.parse::<f64>()
            .map(Some)
            .map_err(|e| TwsError::Decoding(format!("invalid f64 '{s}': {e}")))
    }

    /// Empty string → None.
    pub fn decode_decimal_max(&mut self) -> Result<Option<Decimal>> {
        let s = self.read_field_str()?;
        if s.is_empty() {
            return Ok(None);
        }
        Decimal::from_str(s)
            .map(Some)
            .map_err(|e| TwsError::Decoding(format!("invalid Decimal '{s}': {e}")))
    }

    /// Skip the next field without decoding it.
    pub fn skip_field(&mut self) -> Result<()> {
        let _ = self.read_field_str()?;
        Ok(())
    }

    pub fn skip_fields(&mut self, n: usize) -> Result<()> {
        for _ in 0..n {
            self.skip_field()?;
        }
        Ok(())
    }
}

/// Decode a complete server message body into a [`TwsEvent`].
///
/// Decoding failures never kill the reader; they surface as `Unknown` with
/// the error logged.
pub fn decode_server_msg(data: &[u8], server_version: i32) -> TwsEvent {
    match decode_server_msg_inner(data, server_version) {
        Ok(event) => event,
        Err(e) => {
            tracing::error!("failed to decode server message: {e}");
            TwsEvent::Unknown { msg_id: -1 }
        }
    }
}

fn decode_server_msg_inner(data: &[u8], server_version: i32) -> Result<TwsEvent> {
    let mut dec = MessageDecoder::new(data, server_version);
    let msg_id = dec.decode_i32()?;

    match msg_id {
        incoming::ERR_MSG => decode_err_msg(&mut dec),
        incoming::NEXT_VALID_ID => decode_next_valid_id(&mut dec),
        incoming::MANAGED_ACCTS => decode_managed_accts(&mut dec),
        incoming::CONTRACT_DATA => decode_contract_data(&mut dec),
        incoming::CONTRACT_DATA_END => decode_contract_data_end(&mut dec),
        incoming::HISTORICAL_DATA => decode_historical_data(&mut dec),
        incoming::HISTORICAL_DATA_END => decode_historical_data_end_msg(&mut dec),
        incoming::MARKET_DATA_TYPE => decode_market_data_type(&mut dec),
        _ => Ok(TwsEvent::Unknown { msg_id }),
    }
}

/// ERR_MSG (4).
fn decode_err_msg(dec: &mut MessageDecoder) -> Result<TwsEvent> {
    let version = dec.decode_i32()?;

    if version < 2 {
        // Old format: just a message string.
        let msg = dec.decode_string()?;
        return Ok(TwsEvent::Error {
            req_id: -1,
            error_time: 0,
            code: 0,
            message: msg,
        });
    }

    let id = dec.decode_i32()?;
    let error_code = dec.decode_i32()?;
    let error_msg = dec.decode_string()?;

    if dec.server_version() >= server_version::ADVANCED_ORDER_REJECT {
        dec.skip_field()?; // advancedOrderRejectJson
    }

    let error_time = if dec.server_version() >= server_version::ERROR_TIME {
        dec.decode_i64()?
    } else {
        0
    };

    Ok(TwsEvent::Error {
        req_id: id,
        error_time,
        code: error_code,
        message: error_msg,
    })
}

/// NEXT_VALID_ID (9).
fn decode_next_valid_id(dec: &mut MessageDecoder) -> Result<TwsEvent> {
    let _version = dec.decode_i32()?;
    let order_id = dec.decode_i64()?;
    Ok(TwsEvent::NextValidId { order_id })
}

/// MANAGED_ACCTS (15).
fn decode_managed_accts(dec: &mut MessageDecoder) -> Result<TwsEvent> {
    let _version = dec.decode_i32()?;
    let accounts = dec.decode_string()?;
    Ok(TwsEvent::ManagedAccounts { accounts })
}

/// MARKET_DATA_TYPE (58).
fn decode_market_data_type(dec: &mut MessageDecoder) -> Result<TwsEvent> {
    let _version = dec.decode_i32()?;
    let req_id = dec.decode_i32()?;
    let market_data_type = dec.decode_i32()?;
    Ok(TwsEvent::MarketDataType {
        req_id,
        market_data_type,
    })
}

/// CONTRACT_DATA (10).
///
/// For `server_version >= SIZE_RULES` the message carries no version field;
/// the server version itself drives the field gates.
fn decode_contract_data(dec: &mut MessageDecoder) -> Result<TwsEvent> {
    let sv = dec.server_version();
    let version = if sv < server_version::SIZE_RULES {
        dec.decode_i32()?
    } else {
        sv
    };
    let req_id = if version >= 3 { dec.decode_i32()? } else { -1 };

    let mut d = ContractDetails::default();
    d.contract.symbol = dec.decode_string()?;
    d.contract.sec_type = dec.decode_string()?;
    if sv >= server_version::LAST_TRADE_DATE {
        d.contract.last_trade_date = dec.decode_string()?;
    }
    d.contract.last_trade_date_or_contract_month = dec.decode_string()?;
    d.contract.strike = dec.decode_f64_max()?;
    d.contract.right = dec.decode_string()?;
    d.contract.exchange = dec.decode_string()?;
    d.contract.currency = dec.decode_string()?;
    d.contract.local_symbol = dec.decode_string()?;
    d.market_name = dec.decode_string()?;
    d.contract.trading_class = dec.decode_string()?;
    d.contract.con_id = dec.decode_i32()? as i64;
    d.min_tick = dec.decode_f64()?;
    if (server_version::MD_SIZE_MULTIPLIER..server_version::SIZE_RULES).contains(&sv) {
        dec.skip_field()?; // mdSizeMultiplier
    }
    d.contract.multiplier = dec.decode_string()?;
    d.order_types = dec.decode_string()?;
    d.valid_exchanges = dec.decode_string()?;
    d.price_magnifier = dec.decode_i64()?;
    if version >= 4 {
        d.under_con_id = dec.decode_i32()?;
    }
    if version >= 5 {
        d.long_name = dec.decode_string()?;
        d.contract.primary_exchange = dec.decode_string()?;
    }
    if version >= 6 {
        d.contract_month = dec.decode_string()?;
        d.industry = dec.decode_string()?;
        d.category = dec.decode_string()?;
        d.subcategory = dec.decode_string()?;
        d.time_zone_id = dec.decode_string()?;
        d.trading_hours = dec.decode_string()?;
        d.liquid_hours = dec.decode_string()?;
    }
    if version >= 8 {
        d.ev_rule = dec.decode_string()?;
        d.ev_multiplier = dec.decode_f64()?;
    }
    if version >= 7 {
        // secIdList: tag/value pairs, not served.
        let count = dec.decode_i32()?;
        dec.skip_fields(2 * count.max(0) as usize)?;
    }
    if sv >= server_version::AGG_GROUP {
        d.agg_group = dec.decode_i32_max()?;
    }
    if sv >= server_version::UNDERLYING_INFO {
        d.under_symbol = dec.decode_string()?;
        d.under_sec_type = dec.decode_string()?;
    }
    if sv >= server_version::MARKET_RULES {
        d.market_rule_ids = dec.decode_string()?;
    }
    if sv >= server_version::REAL_EXPIRATION_DATE {
        d.real_expiration_date = dec.decode_string()?;
    }
    if sv >= server_version::STOCK_TYPE {
        d.stock_type = dec.decode_string()?;
    }
    if (server_version::FRACTIONAL_SIZE_SUPPORT..server_version::SIZE_RULES).contains(&sv) {
        dec.skip_field()?; // sizeMinTick
    }
    if sv >= server_version::SIZE_RULES {
        d.min_size = dec.decode_decimal_max()?;
        d.size_increment = dec.decode_decimal_max()?;
        d.suggested_size_increment = dec.decode_decimal_max()?;
    }
    if sv >= server_version::FUND_DATA_FIELDS && d.contract.sec_type == "FUND" {
        // 15 fund descriptor fields plus distribution policy and asset type.
        dec.skip_fields(17)?;
    }
    if sv >= server_version::INELIGIBILITY_REASONS {
        let count = dec.decode_i32()?;
        dec.skip_fields(2 * count.max(0) as usize)?;
    }
    Ok(TwsEvent::ContractDetails {
        req_id,
        details: Box::new(d),
    })
}

/// CONTRACT_DATA_END (52).
fn decode_contract_data_end(dec: &mut MessageDecoder) -> Result<TwsEvent> {
    let _version = dec.decode_i32()?;
    let req_id = dec.decode_i32()?;
    Ok(TwsEvent::ContractDetailsEnd { req_id })
}

/// HISTORICAL_DATA (17).
fn decode_historical_data(dec: &mut MessageDecoder) -> Result<TwsEvent> {
    let sv = dec.server_version();
    if sv < server_version::SYNT_REALTIME_BARS {
        dec.skip_field()?; // version
    }
    let req_id = dec.decode_i32()?;
    if sv < server_version::HISTORICAL_DATA_END {
        dec.skip_fields(2)?; // startDateStr, endDateStr
    }
    let item_count = dec.decode_i32()?;
    let mut bars = Vec::with_capacity(item_count.max(0) as usize);
    for _ in 0..item_count {
        let time = dec.decode_string()?;
        let open = dec.decode_f64()?;
        let high = dec.decode_f64()?;
        let low = dec.decode_f64()?;
        let close = dec.decode_f64()?;
        let volume = dec.decode_decimal_max()?;
        let wap = dec.decode_decimal_max()?;
        if sv < server_version::SYNT_REALTIME_BARS {
            dec.skip_field()?; // hasGaps
        }
        let count = dec.decode_i32()?;
        bars.push(Bar {
            time,
            open,
            high,
            low,
            close,
            volume,
            wap,
            count,
        });
    }
    Ok(TwsEvent::HistoricalData { req_id, bars })
}

/// HISTORICAL_DATA_END (108).
fn decode_historical_data_end_msg(dec: &mut MessageDecoder) -> Result<TwsEvent> {
    let req_id = dec.decode_i32()?;
    let start = dec.decode_string()?;
    let end = dec.decode_string()?;
    Ok(TwsEvent::HistoricalDataEnd { req_id, start, end })
}
