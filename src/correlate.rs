//! Request/response correlation.
//!
//! The TWS wire protocol is connection-oriented and asynchronous: a request
//! goes out with a client-chosen id, and responses for it arrive interleaved
//! with everything else on one socket. The [`Correlator`] turns that into
//! synchronous, timeout-bounded operations: each `submit` registers a pending
//! entry keyed by a fresh id and blocks on its own oneshot until the reader
//! pump delivers a terminal event or the timeout wins the race.
//!
//! The pending map's mutex makes that race atomic: whoever removes the entry
//! first owns the outcome, and at most one terminal signal is ever sent per
//! id. Events for ids no longer in the map are dropped, never redelivered.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;

use ibgate_tws::{Bar, ContractDetails, TwsError};

use crate::error::GatewayError;

/// Response payload accumulated for one request.
#[derive(Debug)]
pub enum Payload {
    Details(Box<ContractDetails>),
    Bars(Vec<Bar>),
}

struct Pending {
    tx: oneshot::Sender<Result<Vec<Payload>, GatewayError>>,
    buf: Vec<Payload>,
}

pub struct Correlator {
    next_id: AtomicI64,
    pending: Mutex<HashMap<i64, Pending>>,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// The pending map is never held across an await; a poisoned lock only
    /// means a panicking holder, whose partial state is still consistent
    /// (insert/remove are single operations).
    fn pending(&self) -> MutexGuard<'_, HashMap<i64, Pending>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of requests currently awaiting a terminal event.
    pub fn in_flight(&self) -> usize {
        self.pending().len()
    }

    /// Run one correlated request.
    ///
    /// Allocates a fresh id (strictly increasing, never reused), registers
    /// the pending entry, then calls `dispatch(id)` to put the request on the
    /// wire. The returned future resolves with the accumulated payload buffer
    /// on the first terminal event, or with an error on dispatch failure,
    /// broker error, lost connection, or timeout. On every return path the id
    /// is no longer registered.
    pub async fn submit<F, Fut>(
        &self,
        timeout: Duration,
        dispatch: F,
    ) -> Result<Vec<Payload>, GatewayError>
    where
        F: FnOnce(i64) -> Fut,
        Fut: Future<Output = Result<(), TwsError>>,
    {
        let req_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending().insert(
            req_id,
            Pending {
                tx,
                buf: Vec::new(),
            },
        );

        if let Err(e) = dispatch(req_id).await {
            self.pending().remove(&req_id);
            return Err(e.into());
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            // The pump dropped the sender without resolving: session is gone.
            Ok(Err(_)) => Err(GatewayError::Disconnected),
            Err(_) => {
                // Retire the id before returning so a late terminal event is
                // dropped instead of resolving into nowhere.
                self.pending().remove(&req_id);
                Err(GatewayError::RequestTimeout {
                    seconds: timeout.as_secs(),
                })
            }
        }
    }

    /// Append a data event to the request's buffer. Unknown ids (already
    /// timed out or never issued) are dropped.
    pub fn push_data(&self, req_id: i64, payload: Payload) {
        let mut map = self.pending();
        match map.get_mut(&req_id) {
            Some(p) => p.buf.push(payload),
            None => tracing::debug!(req_id, "dropping data event for retired request"),
        }
    }

    /// Resolve a request with its accumulated buffer (end marker arrived).
    pub fn complete(&self, req_id: i64) {
        match self.pending().remove(&req_id) {
            Some(p) => {
                let _ = p.tx.send(Ok(p.buf));
            }
            None => tracing::debug!(req_id, "dropping end marker for retired request"),
        }
    }

    /// Resolve a request with a broker error.
    pub fn fail(&self, req_id: i64, code: i32, message: String) {
        match self.pending().remove(&req_id) {
            Some(p) => {
                let _ = p.tx.send(Err(GatewayError::Protocol { code, message }));
            }
            None => {
                tracing::debug!(req_id, code, %message, "dropping error for retired request");
            }
        }
    }

    /// Fail every in-flight request (connection lost or session closed).
    pub fn fail_all(&self) {
        let drained: Vec<Pending> = self.pending().drain().map(|(_, p)| p).collect();
        for p in drained {
            let _ = p.tx.send(Err(GatewayError::Disconnected));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;
    use tokio::sync::oneshot;

    fn bar(time: &str) -> Bar {
        Bar {
            time: time.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn submit_resolves_with_buffered_payloads() {
        let corr = Arc::new(Correlator::new());

        let (id_tx, id_rx) = oneshot::channel();
        let submit = corr.submit(Duration::from_secs(5), move |id| {
            let _ = id_tx.send(id);
            async { Ok(()) }
        });

        let deliver = {
            let corr = corr.clone();
            async move {
                let id = id_rx.await.unwrap();
                corr.push_data(id, Payload::Bars(vec![bar("a"), bar("b")]));
                corr.push_data(id, Payload::Bars(vec![bar("c")]));
                corr.complete(id);
            }
        };

        let (result, ()) = tokio::join!(submit, deliver);
        let payloads = result.unwrap();
        assert_eq!(payloads.len(), 2);
        assert_eq!(corr.in_flight(), 0);
    }

    #[tokio::test]
    async fn broker_error_resolves_exactly_once() {
        let corr = Arc::new(Correlator::new());

        let (id_tx, id_rx) = oneshot::channel();
        let submit = corr.submit(Duration::from_secs(5), move |id| {
            let _ = id_tx.send(id);
            async { Ok(()) }
        });

        let deliver = {
            let corr = corr.clone();
            async move {
                let id = id_rx.await.unwrap();
                corr.push_data(id, Payload::Bars(vec![bar("a")]));
                corr.fail(id, 162, "Historical Market Data Service error".into());
                // A second terminal event for the same id must be a no-op.
                corr.complete(id);
                id
            }
        };

        let (result, id) = tokio::join!(submit, deliver);
        match result {
            Err(GatewayError::Protocol { code, .. }) => assert_eq!(code, 162),
            other => panic!("expected Protocol error, got {other:?}"),
        }
        assert_eq!(corr.in_flight(), 0);
        // And still a no-op now that submit has returned.
        corr.complete(id);
    }

    #[tokio::test]
    async fn timeout_retires_id_and_drops_late_events() {
        let corr = Arc::new(Correlator::new());

        let (id_tx, id_rx) = oneshot::channel();
        let started = Instant::now();
        let result = corr
            .submit(Duration::from_secs(1), move |id| {
                let _ = id_tx.send(id);
                async { Ok(()) }
            })
            .await;
        let elapsed = started.elapsed();

        assert!(matches!(
            result,
            Err(GatewayError::RequestTimeout { seconds: 1 })
        ));
        assert!(elapsed >= Duration::from_secs(1));
        assert!(
            elapsed < Duration::from_secs(2),
            "timeout took {elapsed:?}, expected ~1s"
        );
        assert_eq!(corr.in_flight(), 0);

        // Late events for the retired id must be dropped without effect.
        let id = id_rx.await.unwrap();
        corr.push_data(id, Payload::Bars(vec![bar("late")]));
        corr.complete(id);
        assert_eq!(corr.in_flight(), 0);
    }

    #[tokio::test]
    async fn dispatch_failure_deregisters() {
        let corr = Correlator::new();

        let result = corr
            .submit(Duration::from_secs(5), |_id| async {
                Err(TwsError::Connection("broken pipe".into()))
            })
            .await;

        assert!(matches!(result, Err(GatewayError::Tws(_))));
        assert_eq!(corr.in_flight(), 0);
    }

    #[tokio::test]
    async fn session_level_error_is_harmless() {
        let corr = Correlator::new();
        // Error events with id -1 never match a pending request.
        corr.fail(-1, 2104, "Market data farm connection is OK".into());
        assert_eq!(corr.in_flight(), 0);
    }

    #[tokio::test]
    async fn concurrent_submits_resolve_independently() {
        let corr = Arc::new(Correlator::new());

        let (id_tx_a, id_rx_a) = oneshot::channel();
        let (id_tx_b, id_rx_b) = oneshot::channel();

        let submit_a = corr.submit(Duration::from_secs(5), move |id| {
            let _ = id_tx_a.send(id);
            async { Ok(()) }
        });
        let submit_b = corr.submit(Duration::from_secs(5), move |id| {
            let _ = id_tx_b.send(id);
            async { Ok(()) }
        });

        let deliver = {
            let corr = corr.clone();
            async move {
                let id_a = id_rx_a.await.unwrap();
                let id_b = id_rx_b.await.unwrap();
                assert_ne!(id_a, id_b);
                // Interleave: data for b, data for a, end for b, end for a.
                corr.push_data(id_b, Payload::Bars(vec![bar("b1")]));
                corr.push_data(id_a, Payload::Bars(vec![bar("a1"), bar("a2")]));
                corr.complete(id_b);
                corr.complete(id_a);
            }
        };

        let (res_a, res_b, ()) = tokio::join!(submit_a, submit_b, deliver);
        let a = res_a.unwrap();
        let b = res_b.unwrap();
        match (&a[0], &b[0]) {
            (Payload::Bars(ba), Payload::Bars(bb)) => {
                assert_eq!(ba.len(), 2);
                assert_eq!(bb.len(), 1);
                assert_eq!(ba[0].time, "a1");
                assert_eq!(bb[0].time, "b1");
            }
            other => panic!("unexpected payloads: {other:?}"),
        }
        assert_eq!(corr.in_flight(), 0);
    }

    #[tokio::test]
    async fn fail_all_resolves_in_flight_with_disconnected() {
        let corr = Arc::new(Correlator::new());

        let submit = corr.submit(Duration::from_secs(5), |_id| async { Ok(()) });
        let drop_all = {
            let corr = corr.clone();
            async move {
                tokio::task::yield_now().await;
                corr.fail_all();
            }
        };

        let (result, ()) = tokio::join!(submit, drop_all);
        assert!(matches!(result, Err(GatewayError::Disconnected)));
        assert_eq!(corr.in_flight(), 0);
    }

    #[tokio::test]
    async fn ids_are_strictly_increasing() {
        let corr = Correlator::new();
        let mut last = 0;
        for _ in 0..5 {
            let (id_tx, id_rx) = oneshot::channel();
            let submit = corr.submit(Duration::from_secs(5), move |id| {
                let _ = id_tx.send(id);
                async { Ok(()) }
            });
            let deliver = async {
                let id = id_rx.await.unwrap();
                corr.complete(id);
                id
            };
            let (result, id) = tokio::join!(submit, deliver);
            result.unwrap();
            assert!(id > last, "id {id} not greater than {last}");
            last = id;
        }
    }
}
