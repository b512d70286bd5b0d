//! Remote-control core for an obs-websocket server
//!
//! - [`session`]: one connection with handshake, request correlation and
//!   auto-reconnect
//! - [`reconcile`]: periodic re-sync of remote state into a local parameter
//!   store

pub mod config;
pub mod constants;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod reconcile;
pub mod session;
pub mod transport;

pub use error::{ConnectError, Error, RequestError, Result, TransportError};
