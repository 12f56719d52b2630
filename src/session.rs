//! TWS session management.
//!
//! One [`Session`] owns one broker connection: the write half behind a lock,
//! the correlator, and the event pump task that routes decoded events from
//! the reader into the correlator. A session becomes Ready only once the
//! server sends `NextValidId`; a connect that never gets there is torn down
//! within the connect timeout. There is no automatic retry anywhere: a second
//! connection under the same client id corrupts broker-side session state,
//! so recovery is always an explicit reconnect.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;

use ibgate_tws::{Bar, Contract, ContractDetails, TwsClient, TwsEvent};

use crate::correlate::{Correlator, Payload};
use crate::error::GatewayError;

/// Connection settings for the primary session.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub ib_host: String,
    pub ib_port: u16,
    pub ib_client_id: i32,
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Ready,
    Closed,
}

/// TWS error codes in the 2100 band are connectivity notices (data farm
/// status and the like), not request failures.
fn is_notice(code: i32) -> bool {
    (2100..2200).contains(&code)
}

pub struct Session {
    host: String,
    port: u16,
    client_id: i32,
    client: Mutex<TwsClient>,
    correlator: Arc<Correlator>,
    state: Arc<watch::Sender<SessionState>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Connect under the configured fixed client id.
    pub async fn connect(config: &GatewayConfig) -> Result<Self, GatewayError> {
        Self::connect_with(
            &config.ib_host,
            config.ib_port,
            config.ib_client_id,
            config.connect_timeout,
        )
        .await
    }

    /// Connect, wait for readiness, and request delayed-frozen market data.
    ///
    /// The whole sequence (TCP + handshake + START_API, then the wait for
    /// `NextValidId`) runs against one shared deadline, so the total wall
    /// time never exceeds `timeout`; on a readiness timeout the half-open
    /// connection is shut down before returning.
    pub async fn connect_with(
        host: &str,
        port: u16,
        client_id: i32,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let seconds = timeout.as_secs();
        let deadline = tokio::time::Instant::now() + timeout;

        let (client, events) =
            tokio::time::timeout_at(deadline, TwsClient::connect(host, port, client_id))
                .await
                .map_err(|_| GatewayError::ConnectTimeout { seconds })??;

        let correlator = Arc::new(Correlator::new());
        let (state_tx, _state_rx) = watch::channel(SessionState::Connecting);
        let state = Arc::new(state_tx);
        let (ready_tx, ready_rx) = oneshot::channel();

        let pump = tokio::spawn(run_event_pump(
            events,
            correlator.clone(),
            state.clone(),
            ready_tx,
        ));

        let session = Self {
            host: host.to_string(),
            port,
            client_id,
            client: Mutex::new(client),
            correlator,
            state,
            pump: Mutex::new(Some(pump)),
        };

        match tokio::time::timeout_at(deadline, ready_rx).await {
            Ok(Ok(())) => {}
            _ => {
                session.disconnect().await;
                return Err(GatewayError::ConnectTimeout { seconds });
            }
        }

        // Paper and delayed-data accounts answer historical requests only
        // under delayed-frozen quotes.
        session.client.lock().await.req_market_data_type(2).await?;

        tracing::info!(host, port, client_id, "TWS session ready");
        Ok(session)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn client_id(&self) -> i32 {
        self.client_id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    fn ensure_ready(&self) -> Result<(), GatewayError> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(GatewayError::NotReady)
        }
    }

    /// Shut down the writer, wait for the pump to drain, and fail anything
    /// still in flight. Safe to call more than once.
    pub async fn disconnect(&self) {
        self.state.send_replace(SessionState::Closed);
        self.client.lock().await.disconnect().await;
        if let Some(handle) = self.pump.lock().await.take() {
            let _ = handle.await;
        }
        self.correlator.fail_all();
        tracing::info!(host = %self.host, client_id = self.client_id, "TWS session closed");
    }

    /// Resolve a contract description into full contract details.
    ///
    /// An empty vec means the broker found no match; that is a result, not
    /// an error.
    pub async fn contract_details(
        &self,
        contract: &Contract,
        timeout: Duration,
    ) -> Result<Vec<ContractDetails>, GatewayError> {
        self.ensure_ready()?;
        let payloads = self
            .correlator
            .submit(timeout, |req_id| async move {
                let mut client = self.client.lock().await;
                client.req_contract_details(req_id as i32, contract).await
            })
            .await?;

        Ok(payloads
            .into_iter()
            .filter_map(|p| match p {
                Payload::Details(d) => Some(*d),
                Payload::Bars(_) => None,
            })
            .collect())
    }

    /// Fetch historical bars for an already-resolved contract.
    ///
    /// Bars keep the server's chronological order across chunks.
    #[allow(clippy::too_many_arguments)]
    pub async fn historical_data(
        &self,
        contract: &Contract,
        end_date_time: &str,
        duration: &str,
        bar_size: &str,
        what_to_show: &str,
        use_rth: bool,
        timeout: Duration,
    ) -> Result<Vec<Bar>, GatewayError> {
        self.ensure_ready()?;
        let payloads = self
            .correlator
            .submit(timeout, |req_id| async move {
                let mut client = self.client.lock().await;
                client
                    .req_historical_data(
                        req_id as i32,
                        contract,
                        end_date_time,
                        duration,
                        bar_size,
                        what_to_show,
                        use_rth,
                        1, // formatDate: yyyymmdd strings
                    )
                    .await
            })
            .await?;

        let mut bars = Vec::new();
        for p in payloads {
            if let Payload::Bars(chunk) = p {
                bars.extend(chunk);
            }
        }
        Ok(bars)
    }
}

/// Route decoded events into the correlator until the connection closes.
///
/// This is the single consumer of the reader channel; it never blocks on
/// caller progress, so a stuck HTTP handler cannot stall the socket.
async fn run_event_pump(
    mut events: mpsc::UnboundedReceiver<TwsEvent>,
    correlator: Arc<Correlator>,
    state: Arc<watch::Sender<SessionState>>,
    ready_tx: oneshot::Sender<()>,
) {
    let mut ready_tx = Some(ready_tx);

    while let Some(event) = events.recv().await {
        match event {
            TwsEvent::NextValidId { order_id } => {
                tracing::info!(order_id, "broker signalled readiness");
                state.send_replace(SessionState::Ready);
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(());
                }
            }
            TwsEvent::ManagedAccounts { accounts } => {
                tracing::info!(accounts, "managed accounts");
            }
            TwsEvent::MarketDataType {
                market_data_type, ..
            } => {
                tracing::debug!(market_data_type, "market data type acknowledged");
            }
            TwsEvent::ContractDetails { req_id, details } => {
                correlator.push_data(req_id as i64, Payload::Details(details));
            }
            TwsEvent::ContractDetailsEnd { req_id } => {
                correlator.complete(req_id as i64);
            }
            TwsEvent::HistoricalData { req_id, bars } => {
                correlator.push_data(req_id as i64, Payload::Bars(bars));
            }
            TwsEvent::HistoricalDataEnd { req_id, .. } => {
                correlator.complete(req_id as i64);
            }
            TwsEvent::Error {
                req_id,
                code,
                message,
                ..
            } => {
                if req_id < 0 || is_notice(code) {
                    tracing::info!(req_id, code, %message, "TWS notice");
                } else {
                    correlator.fail(req_id as i64, code, message);
                }
            }
            TwsEvent::ConnectionClosed => {
                if *state.borrow() != SessionState::Closed {
                    tracing::warn!("TWS connection lost");
                    state.send_replace(SessionState::Disconnected);
                }
                break;
            }
            TwsEvent::Unknown { msg_id } => {
                tracing::debug!(msg_id, "ignoring unhandled message");
            }
        }
    }

    correlator.fail_all();
}

/// Result of a connectivity probe.
#[derive(Debug)]
pub struct ProbeReport {
    pub connected: bool,
    pub error: Option<String>,
}

/// Probe broker connectivity with a throwaway session.
///
/// The probe uses a random client id from a range disjoint from any fixed
/// gateway id, so it can never collide with the primary session. Whichever
/// way the probe goes, its connection is released before returning.
pub async fn test_connection(host: &str, port: u16, timeout: Duration) -> ProbeReport {
    let client_id = rand::rng().random_range(10_000..100_000);
    tracing::debug!(host, port, client_id, "probing broker connectivity");

    match Session::connect_with(host, port, client_id, timeout).await {
        Ok(session) => {
            session.disconnect().await;
            ProbeReport {
                connected: true,
                error: None,
            }
        }
        Err(e) => ProbeReport {
            connected: false,
            error: Some(e.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const SV: &str = "200";

    fn framed(fields: &[&str]) -> Vec<u8> {
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

    /// Read one length-prefixed frame and split it into fields.
    async fn read_frame(stream: &mut TcpStream) -> Option<Vec<String>> {
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await.ok()?;
        let len = u32::from_be_bytes(header) as usize;
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await.ok()?;
        Some(
            body.split(|&b| b == 0)
                .map(|f| String::from_utf8_lossy(f).to_string())
                .collect(),
        )
    }

    /// Consume the connect preamble ("API\0" + version frame) and answer the
    /// handshake, then consume START_API.
    async fn serve_handshake(stream: &mut TcpStream) {
        let mut sign = [0u8; 4];
        stream.read_exact(&mut sign).await.unwrap();
        assert_eq!(&sign, b"API\0");
        let _ = read_frame(stream).await.unwrap();

        stream
            .write_all(&framed(&[SV, "20260101 12:00:00"]))
            .await
            .unwrap();

        let start_api = read_frame(stream).await.unwrap();
        assert_eq!(start_api[0], "71");
    }

    /// Mock broker that reaches readiness, then answers one contract-details
    /// request and one historical request with `n_bars` bars split across
    /// two chunks.
    async fn mock_broker_full(n_bars: usize) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            serve_handshake(&mut stream).await;

            stream.write_all(&framed(&["9", "1", "1"])).await.unwrap(); // NEXT_VALID_ID
            stream
                .write_all(&framed(&["15", "1", "DU999"]))
                .await
                .unwrap();

            // req_market_data_type sent right after readiness
            let mdt = read_frame(&mut stream).await.unwrap();
            assert_eq!(mdt[0], "59");
            stream
                .write_all(&framed(&["58", "1", "0", "2"]))
                .await
                .unwrap();

            // contract details request
            let req = read_frame(&mut stream).await.unwrap();
            assert_eq!(req[0], "9");
            let req_id = req[2].clone();
            let details = vec![
                "10",
                &req_id,
                "FGBL",
                "CONTFUT",
                "20250908",
                "202509",
                "",
                "",
                "EUREX",
                "EUR",
                "FGBL SEP 25",
                "FGBL",
                "FGBL",
                "620731036",
                "0.01",
                "1000",
                "ACTIVETIM",
                "EUREX",
                "1",
                "0",
                "Euro Bund Future",
                "",
                "202509",
                "",
                "",
                "",
                "MET",
                "20250601:0800-2200",
                "20250601:0800-2200",
                "",
                "0",
                "0",
                "",
                "",
                "",
                "240",
                "20250908",
                "",
                "1",
                "1",
                "1",
                "0",
            ];
            stream.write_all(&framed(&details)).await.unwrap();
            stream
                .write_all(&framed(&["52", "1", &req_id]))
                .await
                .unwrap();

            // historical request: bars in two chunks, then the end marker
            let hist = read_frame(&mut stream).await.unwrap();
            assert_eq!(hist[0], "20");
            let ticker_id = hist[1].clone();

            let half = n_bars / 2;
            for (lo, hi) in [(0, half), (half, n_bars)] {
                let count = (hi - lo).to_string();
                let mut fields: Vec<String> = vec!["17".into(), ticker_id.clone(), count];
                for i in lo..hi {
                    fields.push(format!("202506{:02}", i + 1)); // time
                    fields.push("130.0".into()); // open
                    fields.push("131.0".into()); // high
                    fields.push("129.5".into()); // low
                    fields.push("130.5".into()); // close
                    fields.push("1000".into()); // volume
                    fields.push("130.4".into()); // wap
                    fields.push("12".into()); // count
                }
                let refs: Vec<&str> = fields.iter().map(String::as_str).collect();
                stream.write_all(&framed(&refs)).await.unwrap();
            }
            stream
                .write_all(&framed(&["108", &ticker_id, "start", "end"]))
                .await
                .unwrap();

            // hold the socket open until the client goes away
            let mut buf = [0u8; 256];
            while let Ok(n) = stream.read(&mut buf).await {
                if n == 0 {
                    break;
                }
            }
        });

        tokio::task::yield_now().await;
        port
    }

    #[tokio::test]
    async fn session_becomes_ready_on_next_valid_id() {
        let port = mock_broker_full(0).await;

        let session = Session::connect_with("127.0.0.1", port, 7, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(session.is_ready());
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.client_id(), 7);

        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn connect_times_out_when_server_stays_silent() {
        // Accepts the TCP connection but never answers the handshake.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });
        tokio::task::yield_now().await;

        let result = Session::connect_with("127.0.0.1", port, 7, Duration::from_secs(1)).await;
        assert!(matches!(
            result,
            Err(GatewayError::ConnectTimeout { seconds: 1 })
        ));
    }

    #[tokio::test]
    async fn connect_times_out_without_readiness_signal() {
        // Handshake completes but NextValidId never arrives.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            serve_handshake(&mut stream).await;
            tokio::time::sleep(Duration::from_secs(30)).await;
        });
        tokio::task::yield_now().await;

        let result = Session::connect_with("127.0.0.1", port, 7, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(GatewayError::ConnectTimeout { .. })));
    }

    #[tokio::test]
    async fn connect_timeout_is_one_shared_deadline() {
        // A slow handshake must eat into the readiness budget: the total
        // wall time stays within the configured timeout, not twice it.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_millis(700)).await;
            serve_handshake(&mut stream).await;
            tokio::time::sleep(Duration::from_secs(30)).await;
        });
        tokio::task::yield_now().await;

        let started = std::time::Instant::now();
        let result = Session::connect_with("127.0.0.1", port, 7, Duration::from_secs(1)).await;
        let elapsed = started.elapsed();

        assert!(matches!(result, Err(GatewayError::ConnectTimeout { .. })));
        assert!(
            elapsed < Duration::from_millis(1400),
            "connect took {elapsed:?}, expected ~1s total"
        );
    }

    #[tokio::test]
    async fn resolve_then_history_returns_all_bars_in_order() {
        let port = mock_broker_full(24).await;

        let session = Session::connect_with("127.0.0.1", port, 7, Duration::from_secs(5))
            .await
            .unwrap();

        let contract = Contract {
            symbol: "FGBL".into(),
            sec_type: "CONTFUT".into(),
            exchange: "EUREX".into(),
            currency: "EUR".into(),
            ..Default::default()
        };
        let details = session
            .contract_details(&contract, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(details.len(), 1);
        assert_eq!(details[0].contract.con_id, 620731036);

        let resolved = Contract {
            con_id: details[0].contract.con_id,
            exchange: details[0].contract.exchange.clone(),
            currency: details[0].contract.currency.clone(),
            sec_type: "FUT".into(),
            ..Default::default()
        };
        let bars = session
            .historical_data(
                &resolved,
                "",
                "10 M",
                "1 day",
                "TRADES",
                false,
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        assert_eq!(bars.len(), 24);
        for (i, bar) in bars.iter().enumerate() {
            assert_eq!(bar.time, format!("202506{:02}", i + 1));
        }

        session.disconnect().await;
    }

    #[tokio::test]
    async fn broker_error_fails_the_matching_request() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            serve_handshake(&mut stream).await;
            stream.write_all(&framed(&["9", "1", "1"])).await.unwrap();
            let _ = read_frame(&mut stream).await.unwrap(); // market data type

            let req = read_frame(&mut stream).await.unwrap();
            let req_id = req[2].clone();
            // ERR_MSG: version 2, id, code 200, message, advOrderReject, errorTime
            stream
                .write_all(&framed(&[
                    "4",
                    "2",
                    &req_id,
                    "200",
                    "No security definition has been found",
                    "",
                    "0",
                ]))
                .await
                .unwrap();

            let mut buf = [0u8; 256];
            while let Ok(n) = stream.read(&mut buf).await {
                if n == 0 {
                    break;
                }
            }
        });
        tokio::task::yield_now().await;

        let session = Session::connect_with("127.0.0.1", port, 7, Duration::from_secs(5))
            .await
            .unwrap();
        let contract = Contract {
            symbol: "NOPE".into(),
            sec_type: "STK".into(),
            exchange: "SMART".into(),
            currency: "USD".into(),
            ..Default::default()
        };
        let result = session
            .contract_details(&contract, Duration::from_secs(5))
            .await;
        match result {
            Err(GatewayError::Protocol { code, .. }) => assert_eq!(code, 200),
            other => panic!("expected Protocol error, got {other:?}"),
        }

        session.disconnect().await;
    }

    #[tokio::test]
    async fn probe_disconnects_on_success() {
        let port = mock_broker_full(0).await;

        let report = test_connection("127.0.0.1", port, Duration::from_secs(5)).await;
        assert!(report.connected);
        assert!(report.error.is_none());
    }

    #[tokio::test]
    async fn probe_reports_failure_without_hanging() {
        // Nothing is listening on this port once the listener is dropped.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let report = test_connection("127.0.0.1", port, Duration::from_secs(1)).await;
        assert!(!report.connected);
        assert!(report.error.is_some());
    }

    #[tokio::test]
    async fn requests_fail_fast_when_not_ready() {
        let port = mock_broker_full(0).await;

        let session = Session::connect_with("127.0.0.1", port, 7, Duration::from_secs(5))
            .await
            .unwrap();
        session.disconnect().await;

        let contract = Contract::default();
        let result = session
            .contract_details(&contract, Duration::from_secs(5))
            .await;
        assert!(matches!(result, Err(GatewayError::NotReady)));
    }
}
