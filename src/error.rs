//! Gateway error taxonomy.
//!
//! "No matching contract" is not represented here: it is an empty collection
//! at the resolver layer, and only the HTTP facade turns it into a 404.

use ibgate_tws::TwsError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// The broker did not become ready within the connect window. The
    /// half-open connection is torn down; `/reconnect` is the only retry.
    #[error("timed out connecting to TWS after {seconds}s")]
    ConnectTimeout { seconds: u64 },

    /// No ready session; the caller should retry after `/reconnect`.
    #[error("not connected to TWS")]
    NotReady,

    /// No terminal event arrived within the request window. The request id
    /// is retired; late events for it are dropped.
    #[error("request timed out after {seconds}s")]
    RequestTimeout { seconds: u64 },

    /// The broker answered the request with an error.
    #[error("TWS error {code}: {message}")]
    Protocol { code: i32, message: String },

    /// The session's connection went away while requests were in flight.
    #[error("connection to TWS lost")]
    Disconnected,

    /// Transport or codec failure from the wire client.
    #[error(transparent)]
    Tws(#[from] TwsError),
}
