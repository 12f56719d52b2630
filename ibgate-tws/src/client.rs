//! TWS API client.
//!
//! [`TwsClient`] owns the write half of a connected transport and encodes
//! request messages. `connect` performs the handshake, sends START_API and
//! spawns the background reader; server responses arrive as [`TwsEvent`]s on
//! the returned channel.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::encoder::MessageEncoder;
use crate::errors::{Result, TwsError};
use crate::events::TwsEvent;
use crate::models::Contract;
use crate::protocol::{outgoing, server_version};
use crate::reader::MessageReader;
use crate::transport::{Transport, TransportWriter};

pub struct TwsClient {
    writer: TransportWriter,
    server_version: i32,
    tws_time: String,
    client_id: i32,
    reader_handle: Option<JoinHandle<()>>,
}

impl TwsClient {
    /// Connect to TWS/Gateway, perform the handshake, send START_API and
    /// spawn the reader task.
    ///
    /// The first events on the returned channel are typically `NextValidId`
    /// and `ManagedAccounts`.
    pub async fn connect(
        host: &str,
        port: u16,
        client_id: i32,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TwsEvent>)> {
        let mut transport = Transport::connect(host, port).await?;
        let sv = transport.server_version();
        let tws_time = transport.tws_time().to_string();

        tracing::info!(server_version = sv, client_id, "TWS client connecting");

        transport.start_api(client_id).await?;

        let (transport_reader, transport_writer) = transport.into_split();
        let reader = MessageReader::new(transport_reader);
        let (rx, reader_handle) = reader.spawn();

        let client = Self {
            writer: transport_writer,
            server_version: sv,
            tws_time,
            client_id,
            reader_handle: Some(reader_handle),
        };

        Ok((client, rx))
    }

    /// Negotiated server version.
    pub fn server_version(&self) -> i32 {
        self.server_version
    }

    /// TWS connection time string from the handshake.
    pub fn tws_time(&self) -> &str {
        &self.tws_time
    }

    /// Client ID used for this connection.
    pub fn client_id(&self) -> i32 {
        self.client_id
    }

    /// Shut down the write half and stop the reader task. The reader may be
    /// blocked on the socket while the server holds its side open, so it is
    /// aborted rather than awaited; dropping its event sender tells the
    /// consumer the stream is over.
    ///
    /// Safe to call more than once.
    pub async fn disconnect(&mut self) {
        self.writer.shutdown().await;
        if let Some(handle) = self.reader_handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }

    fn check_server_version(&self, required: i32, feature: &str) -> Result<()> {
        if self.server_version < required {
            return Err(TwsError::Protocol(format!(
                "server version {} does not support {feature} (requires {required})",
                self.server_version
            )));
        }
        Ok(())
    }

    async fn send_encoded(&mut self, enc: MessageEncoder) -> Result<()> {
        let bytes = enc.finalize()?;
        self.writer.send_message(&bytes).await
    }

    /// Request contract details.
    ///
    /// Responses: `ContractDetails` (one per match), then `ContractDetailsEnd`.
    pub async fn req_contract_details(&mut self, req_id: i32, contract: &Contract) -> Result<()> {
        let sv = self.server_version;
        let mut enc = MessageEncoder::new();
        enc.encode_field_i32(outgoing::REQ_CONTRACT_DATA);
        enc.encode_field_i32(8); // version
        if sv >= server_version::CONTRACT_DATA_CHAIN {
            enc.encode_field_i32(req_id);
        }
        enc.encode_field_i64(contract.con_id);
        enc.encode_field_str(&contract.symbol);
        enc.encode_field_str(&contract.sec_type);
        enc.encode_field_str(&contract.last_trade_date_or_contract_month);
        enc.encode_field_max_f64(contract.strike);
        enc.encode_field_str(&contract.right);
        enc.encode_field_str(&contract.multiplier);

        enc.encode_field_str(&contract.exchange);
        if sv >= server_version::PRIMARYEXCH {
            enc.encode_field_str(&contract.primary_exchange);
        }

        enc.encode_field_str(&contract.currency);
        enc.encode_field_str(&contract.local_symbol);
        if sv >= server_version::TRADING_CLASS {
            enc.encode_field_str(&contract.trading_class);
        }
        enc.encode_field_bool(contract.include_expired);
        if sv >= server_version::SEC_ID_TYPE {
            enc.encode_field_str(&contract.sec_id_type);
            enc.encode_field_str(&contract.sec_id);
        }
        if sv >= server_version::BOND_ISSUERID {
            enc.encode_field_str(&contract.issuer_id);
        }
        self.send_encoded(enc).await
    }

    /// Request historical data bars.
    ///
    /// Responses: `HistoricalData` chunks, then `HistoricalDataEnd`.
    #[allow(clippy::too_many_arguments)]
    pub async fn req_historical_data(
        &mut self,
        ticker_id: i32,
        contract: &Contract,
        end_date_time: &str,
        duration_str: &str,
        bar_size_setting: &str,
        what_to_show: &str,
        use_rth: bool,
        format_date: i32,
    ) -> Result<()> {
        let sv = self.server_version;
        let mut enc = MessageEncoder::new();
        enc.encode_field_i32(outgoing::REQ_HISTORICAL_DATA);
        if sv < server_version::SYNT_REALTIME_BARS {
            enc.encode_field_i32(6); // version
        }
        enc.encode_field_i32(ticker_id);

        if sv >= server_version::TRADING_CLASS {
            enc.encode_field_i64(contract.con_id);
        }
        enc.encode_field_str(&contract.symbol);
        enc.encode_field_str(&contract.sec_type);
        enc.encode_field_str(&contract.last_trade_date_or_contract_month);
        enc.encode_field_max_f64(contract.strike);
        enc.encode_field_str(&contract.right);
        enc.encode_field_str(&contract.multiplier);
        enc.encode_field_str(&contract.exchange);
        enc.encode_field_str(&contract.primary_exchange);
        enc.encode_field_str(&contract.currency);
        enc.encode_field_str(&contract.local_symbol);
        if sv >= server_version::TRADING_CLASS {
            enc.encode_field_str(&contract.trading_class);
        }
        enc.encode_field_bool(contract.include_expired);
        enc.encode_field_str(end_date_time);
        enc.encode_field_str(bar_size_setting);
        enc.encode_field_str(duration_str);
        enc.encode_field_bool(use_rth);
        enc.encode_field_str(what_to_show);
        enc.encode_field_i32(format_date);

        // Combo contracts need a leg count; this client never builds legs.
        if contract.sec_type == "BAG" {
            enc.encode_field_i32(0);
        }

        if sv >= server_version::SYNT_REALTIME_BARS {
            enc.encode_field_bool(false); // keepUpToDate
        }
        if sv >= server_version::LINKING {
            enc.encode_field_str(""); // chartOptions
        }
        self.send_encoded(enc).await
    }

    /// Set the market data type (1 real-time, 2 frozen, 3 delayed,
    /// 4 delayed-frozen).
    pub async fn req_market_data_type(&mut self, market_data_type: i32) -> Result<()> {
        self.check_server_version(server_version::REQ_MARKET_DATA_TYPE, "req_market_data_type")?;
        let mut enc = MessageEncoder::new();
        enc.encode_field_i32(outgoing::REQ_MARKET_DATA_TYPE);
        enc.encode_field_i32(1); // version
        enc.encode_field_i32(market_data_type);
        self.send_encoded(enc).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::HEADER_LEN;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn build_framed_msg(fields: &[&str]) -> Vec<u8> {
        let mut body = Vec::new();
        for f in fields {
            body.extend_from_slice(f.as_bytes());
            body.push(0);
        }
        let mut frame = Vec::new();
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend(body);
        frame
    }

    /// Split a framed message into its null-terminated fields.
    fn split_fields(framed: &[u8]) -> Vec<String> {
        let body = &framed[HEADER_LEN..];
        body.split(|&b| b == 0)
            .map(|f| String::from_utf8_lossy(f).to_string())
            .collect()
    }

    /// Mock TWS that completes the handshake and start_api, then captures the
    /// next message the client sends.
    async fn mock_tws_capture_request(sv: i32) -> (u16, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];

            // connect request
            let _ = stream.read(&mut buf).await.unwrap();
            let handshake = build_framed_msg(&[&sv.to_string(), "20260101 12:00:00"]);
            stream.write_all(&handshake).await.unwrap();

            // start_api
            let _ = stream.read(&mut buf).await.unwrap();

            // captured request
            let mut msg_buf = vec![0u8; 2048];
            let n = stream.read(&mut msg_buf).await.unwrap();
            msg_buf.truncate(n);
            msg_buf
        });

        tokio::task::yield_now().await;
        (port, handle)
    }

    #[tokio::test]
    async fn req_contract_details_field_order() {
        let (port, handle) = mock_tws_capture_request(187).await;

        let (mut client, _rx) = TwsClient::connect("127.0.0.1", port, 9).await.unwrap();
        assert_eq!(client.server_version(), 187);
        assert_eq!(client.client_id(), 9);

        let contract = Contract {
            symbol: "FGBL".into(),
            sec_type: "CONTFUT".into(),
            exchange: "EUREX".into(),
            currency: "EUR".into(),
            last_trade_date_or_contract_month: "202509".into(),
            ..Default::default()
        };
        client.req_contract_details(42, &contract).await.unwrap();

        let fields = split_fields(&handle.await.unwrap());
        assert_eq!(fields[0], "9"); // REQ_CONTRACT_DATA
        assert_eq!(fields[1], "8"); // version
        assert_eq!(fields[2], "42"); // reqId
        assert_eq!(fields[3], "0"); // conId
        assert_eq!(fields[4], "FGBL"); // symbol
        assert_eq!(fields[5], "CONTFUT"); // secType
        assert_eq!(fields[6], "202509"); // lastTradeDateOrContractMonth
        assert_eq!(fields[7], ""); // strike (unset)
        assert_eq!(fields[8], ""); // right
        assert_eq!(fields[9], ""); // multiplier
        assert_eq!(fields[10], "EUREX"); // exchange
        assert_eq!(fields[11], ""); // primaryExchange
        assert_eq!(fields[12], "EUR"); // currency
        assert_eq!(fields[13], ""); // localSymbol
        assert_eq!(fields[14], ""); // tradingClass
        assert_eq!(fields[15], "0"); // includeExpired
        assert_eq!(fields[16], ""); // secIdType
        assert_eq!(fields[17], ""); // secId
        assert_eq!(fields[18], ""); // issuerId (sv >= 176)
    }

    #[tokio::test]
    async fn req_historical_data_field_order() {
        let (port, handle) = mock_tws_capture_request(187).await;

        let (mut client, _rx) = TwsClient::connect("127.0.0.1", port, 9).await.unwrap();

        let contract = Contract {
            con_id: 620731036,
            symbol: "FGBL".into(),
            sec_type: "FUT".into(),
            exchange: "EUREX".into(),
            currency: "EUR".into(),
            ..Default::default()
        };
        client
            .req_historical_data(7, &contract, "", "10 M", "1 day", "TRADES", false, 1)
            .await
            .unwrap();

        let fields = split_fields(&handle.await.unwrap());
        assert_eq!(fields[0], "20"); // REQ_HISTORICAL_DATA
        assert_eq!(fields[1], "7"); // tickerId (no version field at sv 187)
        assert_eq!(fields[2], "620731036"); // conId
        assert_eq!(fields[3], "FGBL"); // symbol
        assert_eq!(fields[4], "FUT"); // secType
        assert_eq!(fields[9], "EUREX"); // exchange
        assert_eq!(fields[11], "EUR"); // currency
        assert_eq!(fields[14], "0"); // includeExpired
        assert_eq!(fields[15], ""); // endDateTime
        assert_eq!(fields[16], "1 day"); // barSize
        assert_eq!(fields[17], "10 M"); // duration
        assert_eq!(fields[18], "0"); // useRTH
        assert_eq!(fields[19], "TRADES"); // whatToShow
        assert_eq!(fields[20], "1"); // formatDate
        assert_eq!(fields[21], "0"); // keepUpToDate
        assert_eq!(fields[22], ""); // chartOptions
    }

    #[tokio::test]
    async fn req_market_data_type_message() {
        let (port, handle) = mock_tws_capture_request(187).await;

        let (mut client, _rx) = TwsClient::connect("127.0.0.1", port, 9).await.unwrap();
        client.req_market_data_type(2).await.unwrap();

        let fields = split_fields(&handle.await.unwrap());
        assert_eq!(fields[0], "59"); // REQ_MARKET_DATA_TYPE
        assert_eq!(fields[1], "1"); // version
        assert_eq!(fields[2], "2"); // delayed-frozen
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let (port, _handle) = mock_tws_capture_request(187).await;

        let (mut client, _rx) = TwsClient::connect("127.0.0.1", port, 9).await.unwrap();
        client.disconnect().await;
        client.disconnect().await;
    }
}
