//! ibgate-tws -- minimal async Rust client for the IB TWS API wire protocol.
//!
//! Covers the slice of the protocol the gateway needs: the V100+ handshake,
//! START_API, contract-details and historical-data requests, and decoding of
//! the corresponding responses plus session-level notices.
//!
//! ## Modules
//!
//! - [`protocol`] -- message IDs, framing sizes, server-version gates
//! - [`errors`] -- error types for the library
//! - [`models`] -- Contract, ContractDetails, Bar
//! - [`encoder`] -- wire-format message encoding
//! - [`decoder`] -- wire-format message decoding + server message dispatch
//! - [`events`] -- TwsEvent enum (decoded server messages)
//! - [`transport`] -- async TCP transport with V100+ framing
//! - [`reader`] -- background message reader (spawned tokio task)
//! - [`client`] -- TwsClient (request entry point)

pub mod client;
pub mod decoder;
pub mod encoder;
pub mod errors;
pub mod events;
pub mod models;
pub mod protocol;
pub mod reader;
pub mod transport;

pub use client::TwsClient;
pub use errors::TwsError;
pub use events::TwsEvent;
pub use models::{Bar, Contract, ContractDetails};
