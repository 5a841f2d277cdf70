//! Streaming COPY on top of the dispatch engine.
//!
//! Ingress (`COPY ... FROM STDIN`) reuses ordinary dispatch: every chunk is
//! one `PutCopyData` request and `PutCopyEnd` commits or aborts the transfer.
//!
//! Egress (`COPY ... TO STDOUT`) replaces request/response pairing with a
//! pull loop. A pump thread is started on the first
//! [`Connection::begin_egress`] and lives for the whole COPY; every pull
//! releases one permit, and the pump reads at most the requested number of
//! bytes before handing the chunk across the bridge to the consumer.
//!
//! While any COPY is open the connection is not [`Connection::is_ready`] and
//! accepts no ordinary operations.

pub(crate) mod egress;

use bytes::Bytes;

use crate::connection::{Connection, Outcome};
use crate::error::{Error, Result};
use crate::session::{Operation, Session};
use crate::types::{encode, Value};

/// Delivered to the egress consumer on the draining thread.
#[derive(Debug)]
pub enum CopyEvent {
    /// At most the requested number of bytes of COPY text.
    Data(Bytes),
    /// The COPY finished. Delivered once; the connection is `READY` again.
    End,
    /// The COPY failed or the connection was closed. Delivered once, in
    /// place of `End`.
    Failed(Error),
}

impl CopyEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CopyEvent::Data(_))
    }
}

/// Receives the events of an egress COPY.
pub type Consumer = Box<dyn FnMut(CopyEvent) + Send>;

impl<S: Session> Connection<S> {
    /// Issue a `COPY ... FROM STDIN` command. Completes with
    /// `Outcome::CopyStarted(CopyMode::In)` once the server accepts data.
    pub fn copy_from(
        &self,
        command: &str,
        params: Option<&[Value]>,
        callback: impl FnOnce(Result<Outcome>) + Send + 'static,
    ) -> Result<()> {
        self.submit(
            Operation::CopyFrom {
                command: command.to_string(),
                params: params.map(|p| p.iter().map(encode::to_sql).collect()),
            },
            callback,
        )
    }

    /// Send one chunk of ingress data. Requires an open ingress COPY and no
    /// other chunk in flight.
    pub fn put_copy_data(
        &self,
        data: impl Into<Bytes>,
        callback: impl FnOnce(Result<Outcome>) + Send + 'static,
    ) -> Result<()> {
        self.submit(Operation::PutCopyData(data.into()), callback)
    }

    /// Finish the ingress COPY. With `error` the server discards the data and
    /// the callback receives [`Error::CopyAborted`]; otherwise it receives the
    /// number of rows copied.
    pub fn put_copy_end(
        &self,
        error: Option<&str>,
        callback: impl FnOnce(Result<Outcome>) + Send + 'static,
    ) -> Result<()> {
        self.submit(
            Operation::PutCopyEnd {
                error: error.map(str::to_string),
            },
            callback,
        )
    }
}
