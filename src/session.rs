//! The blocking client handle driven by a connection's worker.
//!
//! A [`Session`] is whatever blocking client library sits underneath (libpq
//! bindings, a pure-Rust synchronous client, a test double). It is owned by
//! exactly one thread at a time: the worker while a call runs, the caller
//! side in between. Only [`CancelSignal`] may be used concurrently with a
//! call in progress.

use std::sync::Arc;

use bytes::Bytes;
use smallvec::SmallVec;

use crate::error::Result;
use crate::types::Oid;

/// Positional text parameters; `None` binds SQL NULL.
pub type Params = SmallVec<[Option<String>; 8]>;

/// Column descriptor of a row-bearing result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub type_oid: Oid,
}

impl Column {
    pub fn new(name: impl Into<String>, type_oid: Oid) -> Self {
        Self {
            name: name.into(),
            type_oid,
        }
    }
}

/// Raw server reply to one blocking call.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Empty query string, or nothing to report.
    Empty,
    /// Command completed; `rows` is the affected-row count when the command
    /// tag carries one.
    Command { rows: Option<u64> },
    /// Result set in text format. Each cell is `None` for SQL null.
    Rows {
        columns: Vec<Column>,
        rows: Vec<Vec<Option<Bytes>>>,
    },
    /// The server is waiting for `COPY FROM STDIN` data.
    CopyIn,
    /// The server is streaming `COPY TO STDOUT` data.
    CopyOut,
}

/// One read from an open egress COPY.
#[derive(Debug)]
pub enum CopyData {
    /// One row (or partial buffer) of COPY text.
    Row(Bytes),
    /// The COPY finished and its final command status was consumed.
    Done,
    Failed(crate::Error),
}

/// Sends a protocol-level cancel request for whatever the session is doing.
pub trait CancelSignal: Send + Sync {
    /// Best effort. An error means the request could not be delivered.
    fn cancel(&self) -> Result<()>;
}

pub trait Session: Send + 'static {
    fn exec(&mut self, command: &str, params: Option<&[Option<String>]>) -> Result<Reply>;

    fn prepare(&mut self, name: &str, command: &str) -> Result<Reply>;

    fn exec_prepared(&mut self, name: &str, params: &[Option<String>]) -> Result<Reply>;

    /// Queue one chunk of ingress COPY data.
    fn put_copy_data(&mut self, data: &[u8]) -> Result<()>;

    /// End an ingress COPY. With `error` the server aborts the COPY using that
    /// message; otherwise the data is committed and the command status read.
    fn put_copy_end(&mut self, error: Option<&str>) -> Result<Reply>;

    /// Blocking read of the next egress COPY row.
    fn get_copy_data(&mut self) -> CopyData;

    /// A handle able to cancel the running call from another thread.
    fn cancel_signal(&self) -> Option<Arc<dyn CancelSignal>>;

    /// Release the underlying connection. Called exactly once.
    fn finish(self);
}

/// An operation submitted to a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Exec {
        command: String,
        params: Option<Params>,
    },
    Prepare {
        name: String,
        command: String,
    },
    ExecPrepared {
        name: String,
        params: Params,
    },
    /// Issue a `COPY ... FROM STDIN` command.
    CopyFrom {
        command: String,
        params: Option<Params>,
    },
    /// Issue a `COPY ... TO STDOUT` command.
    CopyTo {
        command: String,
        params: Option<Params>,
    },
    PutCopyData(Bytes),
    PutCopyEnd {
        error: Option<String>,
    },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Exec { params: None, .. } => "exec",
            Operation::Exec { .. } => "execParams",
            Operation::Prepare { .. } => "prepare",
            Operation::ExecPrepared { .. } => "execPrepared",
            Operation::CopyFrom { .. } => "copyFromStream",
            Operation::CopyTo { .. } => "copyToStream",
            Operation::PutCopyData(_) => "putCopyData",
            Operation::PutCopyEnd { .. } => "putCopyEnd",
        }
    }

    /// Whether this operation feeds an open ingress COPY rather than starting
    /// a new request.
    pub(crate) fn is_copy_in_chunk(&self) -> bool {
        matches!(self, Operation::PutCopyData(_) | Operation::PutCopyEnd { .. })
    }

    /// Perform the blocking call. Runs on the worker thread.
    pub(crate) fn run<S: Session>(&self, session: &mut S) -> Result<Reply> {
        match self {
            Operation::Exec { command, params }
            | Operation::CopyFrom { command, params }
            | Operation::CopyTo { command, params } => session.exec(command, params.as_deref()),
            Operation::Prepare { name, command } => session.prepare(name, command),
            Operation::ExecPrepared { name, params } => session.exec_prepared(name, params),
            Operation::PutCopyData(data) => session.put_copy_data(data).map(|()| Reply::Empty),
            Operation::PutCopyEnd { error } => session.put_copy_end(error.as_deref()),
        }
    }
}
