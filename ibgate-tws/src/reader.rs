//! Background message reader.
//!
//! A spawned task reads framed messages, decodes them into [`TwsEvent`]s and
//! forwards them through an unbounded mpsc channel. The task exits when the
//! connection closes or the receiver is dropped; a closing connection always
//! produces a final `ConnectionClosed` event.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::decoder::decode_server_msg;
use crate::errors::TwsError;
use crate::events::TwsEvent;
use crate::transport::TransportReader;

pub struct MessageReader {
    transport_reader: TransportReader,
    server_version: i32,
}

impl MessageReader {
    pub fn new(transport_reader: TransportReader) -> Self {
        let server_version = transport_reader.server_version();
        Self {
            transport_reader,
            server_version,
        }
    }

    /// Spawn the read loop; returns the event receiver and the task handle.
    pub fn spawn(self) -> (mpsc::UnboundedReceiver<TwsEvent>, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();

        let handle = tokio::spawn(async move {
            self.run(tx).await;
        });

        (rx, handle)
    }

    async fn run(mut self, tx: mpsc::UnboundedSender<TwsEvent>) {
        loop {
            match self.transport_reader.read_message().await {
                Ok(msg) => {
                    let event = decode_server_msg(&msg, self.server_version);
                    if tx.send(event).is_err() {
                        tracing::debug!("event receiver dropped, reader stopping");
                        break;
                    }
                }
                Err(TwsError::Disconnected(reason)) => {
                    tracing::info!("server disconnected: {reason}");
                    let _ = tx.send(TwsEvent::ConnectionClosed);
                    break;
                }
                Err(e) => {
                    tracing::error!("reader error: {e}");
                    let _ = tx.send(TwsEvent::Error {
                        req_id: -1,
                        error_time: 0,
                        code: 0,
                        message: format!("reader error: {e}"),
                    });
                    let _ = tx.send(TwsEvent::ConnectionClosed);
                    break;
                }
            }
        }
    }
}
