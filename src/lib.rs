//! pgbridge - asynchronous, cancellable dispatch over a blocking PostgreSQL
//! client handle.
//!
//! Architecture:
//! - `types`: text-format value decoding (scalars, arrays, bytea, timestamps)
//! - `state`: connection state machine
//! - `session`: the blocking client handle a connection drives
//! - `bridge`: ready-list that hands worker completions to the caller's thread
//! - `connection`: one worker per connection, single-flight dispatch, abort
//! - `copy`: streaming COPY in both directions
//! - `client`: async facade with FIFO queuing

pub mod bridge;
pub mod client;
pub mod config;
pub mod connection;
pub mod copy;
pub mod error;
pub mod session;
pub mod state;
pub mod types;

#[cfg(test)]
mod testing;

pub use bridge::Bridge;
pub use client::{Client, CopyInWriter, CopyOutReader};
pub use config::ConnectionConfig;
pub use connection::{Callback, Connection, Outcome, Row, RowSet, SharedColumns};
pub use copy::{Consumer, CopyEvent};
pub use error::{Error, ErrorField, ErrorKind, Result, ServerError};
pub use session::{CancelSignal, Column, CopyData, Operation, Params, Reply, Session};
pub use state::{ConnState, CopyMode};
pub use types::{decode, Oid, Timestamp, Value};
