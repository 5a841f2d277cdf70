//! Async facade over a [`Connection`].
//!
//! The dispatch engine is callback based and rejects a second operation
//! while one is in flight. `Client` turns that into plain `async fn`s: calls
//! queue FIFO on a tokio mutex, each one is submitted only once the previous
//! has completed, and the awaiting task drives the client's own [`Bridge`]
//! while it waits.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Mutex, MutexGuard};
use tracing::debug;

use crate::bridge::Bridge;
use crate::config::ConnectionConfig;
use crate::connection::{Connection, Outcome};
use crate::copy::CopyEvent;
use crate::error::{Error, Result};
use crate::session::Session;
use crate::state::{ConnState, CopyMode};
use crate::types::Value;

/// Upper bound on one wait for the bridge, so a completion drained by
/// another task is never missed for long.
const BRIDGE_POLL: Duration = Duration::from_millis(50);

/// Sent with the `COPY` end of an ingress transfer nobody finished.
const ABANDONED: &str = "COPY abandoned by client";

pub struct Client<S: Session> {
    conn: Connection<S>,
    bridge: Bridge,
    queue: Mutex<()>,
}

impl<S: Session> Client<S> {
    /// Open a connection and wait until it is `READY`.
    pub async fn connect<F>(config: ConnectionConfig, connector: F) -> Result<Self>
    where
        F: FnOnce(&str) -> Result<S> + Send + 'static,
    {
        let bridge = Bridge::new();
        let (tx, rx) = oneshot::channel();
        let conn = Connection::open(&bridge, config, connector, move |result| {
            let _ = tx.send(result);
        })?;
        let client = Self {
            conn,
            bridge,
            queue: Mutex::new(()),
        };
        client.wait(rx).await??;
        Ok(client)
    }

    pub fn connection(&self) -> &Connection<S> {
        &self.conn
    }

    pub async fn exec(&self, command: &str) -> Result<Outcome> {
        let _turn = self.begin().await?;
        let (tx, rx) = oneshot::channel();
        self.conn.exec(command, reply(tx))?;
        self.reject_copy(self.wait(rx).await?).await
    }

    pub async fn exec_params(&self, command: &str, params: &[Value]) -> Result<Outcome> {
        let _turn = self.begin().await?;
        let (tx, rx) = oneshot::channel();
        self.conn.exec_params(command, params, reply(tx))?;
        self.reject_copy(self.wait(rx).await?).await
    }

    pub async fn prepare(&self, name: &str, command: &str) -> Result<()> {
        let _turn = self.begin().await?;
        let (tx, rx) = oneshot::channel();
        self.conn.prepare(name, command, reply(tx))?;
        self.wait(rx).await?.map(|_| ())
    }

    pub async fn exec_prepared(&self, name: &str, params: &[Value]) -> Result<Outcome> {
        let _turn = self.begin().await?;
        let (tx, rx) = oneshot::channel();
        self.conn.exec_prepared(name, params, reply(tx))?;
        self.reject_copy(self.wait(rx).await?).await
    }

    /// Start a `COPY ... FROM STDIN`. The writer holds the client until it is
    /// finished or aborted.
    pub async fn copy_from(
        &self,
        command: &str,
        params: Option<&[Value]>,
    ) -> Result<CopyInWriter<'_, S>> {
        let guard = self.begin().await?;
        let (tx, rx) = oneshot::channel();
        self.conn.copy_from(command, params, reply(tx))?;
        self.wait(rx).await??;
        Ok(CopyInWriter {
            client: self,
            _guard: guard,
            open: true,
        })
    }

    /// Start a `COPY ... TO STDOUT`. The reader holds the client until it has
    /// been read to the end or dropped.
    pub async fn copy_to(
        &self,
        command: &str,
        params: Option<&[Value]>,
    ) -> Result<CopyOutReader<'_, S>> {
        let guard = self.begin().await?;
        let (events_tx, events) = mpsc::unbounded_channel();
        let (tx, rx) = oneshot::channel();
        self.conn.copy_to(
            command,
            params,
            move |event| {
                let _ = events_tx.send(event);
            },
            reply(tx),
        )?;
        self.wait(rx).await??;
        Ok(CopyOutReader {
            client: self,
            _guard: guard,
            events,
            chunk_size: self.conn.config().copy_chunk_size,
            done: false,
        })
    }

    /// Send a cancel request for the running operation.
    pub fn cancel(&self) {
        self.conn.cancel();
    }

    /// Close the connection and wait for an in-flight operation to unwind.
    pub async fn close(&self) {
        self.conn.close();
        while self.conn.state() == ConnState::Abort {
            self.poll_bridge().await;
        }
    }

    /// Take the queue, then let a completion left behind by a dropped future
    /// or an abandoned COPY land before submitting. An ingress COPY whose
    /// writer went away mid-write is ended here.
    async fn begin(&self) -> Result<MutexGuard<'_, ()>> {
        let guard = self.queue.lock().await;
        loop {
            match (self.conn.state(), self.conn.copy_mode()) {
                (ConnState::Busy | ConnState::Abort, _) | (ConnState::Ready, CopyMode::Out) => {
                    self.poll_bridge().await;
                }
                (ConnState::Ready, CopyMode::In) => {
                    debug!(conn = self.conn.id(), "ending abandoned COPY in");
                    let (tx, rx) = oneshot::channel();
                    self.conn.put_copy_end(Some(ABANDONED), reply(tx))?;
                    // The server's rejection of the aborted COPY is expected.
                    let _ = self.wait(rx).await?;
                }
                _ => break,
            }
        }
        Ok(guard)
    }

    async fn poll_bridge(&self) {
        let _ = tokio::time::timeout(BRIDGE_POLL, self.bridge.turn()).await;
    }

    async fn wait<T>(&self, mut rx: oneshot::Receiver<T>) -> Result<T> {
        loop {
            tokio::select! {
                result = &mut rx => return result.map_err(|_| Error::Closed),
                _ = self.poll_bridge() => {}
            }
        }
    }

    /// COPY commands must go through `copy_from` / `copy_to`; one started by
    /// a plain exec is shut down again.
    async fn reject_copy(&self, outcome: Result<Outcome>) -> Result<Outcome> {
        let mode = match outcome {
            Ok(Outcome::CopyStarted(mode)) => mode,
            other => return other,
        };
        debug!(conn = self.conn.id(), mode = mode.as_str(), "COPY started by exec");
        match mode {
            CopyMode::In => {
                let (tx, rx) = oneshot::channel();
                self.conn
                    .put_copy_end(Some("COPY must use copy_from"), reply(tx))?;
                let _ = self.wait(rx).await?;
            }
            _ => {
                self.conn.end_egress()?;
                while self.conn.copy_mode() == CopyMode::Out {
                    self.poll_bridge().await;
                }
            }
        }
        Err(Error::Protocol(
            "COPY commands must use copy_from or copy_to".to_string(),
        ))
    }
}

fn reply(tx: oneshot::Sender<Result<Outcome>>) -> impl FnOnce(Result<Outcome>) + Send + 'static {
    move |result| {
        let _ = tx.send(result);
    }
}

/// Sends ingress COPY data. Dropping it unfinished aborts the COPY, either
/// right away or, while a write is still in flight, when the client is next
/// used.
pub struct CopyInWriter<'a, S: Session> {
    client: &'a Client<S>,
    _guard: MutexGuard<'a, ()>,
    open: bool,
}

impl<S: Session> CopyInWriter<'_, S> {
    pub async fn write(&mut self, data: impl Into<Bytes>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.client.conn.put_copy_data(data, reply(tx))?;
        self.client.wait(rx).await?.map(|_| ())
    }

    /// Commit the COPY; returns the number of rows copied when reported.
    pub async fn finish(mut self) -> Result<Option<u64>> {
        self.open = false;
        let (tx, rx) = oneshot::channel();
        self.client.conn.put_copy_end(None, reply(tx))?;
        Ok(self.client.wait(rx).await??.rows_affected())
    }

    /// Abort the COPY; the server discards everything sent so far.
    pub async fn abort(mut self, message: &str) -> Result<()> {
        self.open = false;
        let (tx, rx) = oneshot::channel();
        self.client.conn.put_copy_end(Some(message), reply(tx))?;
        match self.client.wait(rx).await? {
            Ok(_) | Err(Error::CopyAborted(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl<S: Session> Drop for CopyInWriter<'_, S> {
    fn drop(&mut self) {
        if self.open {
            let _ = self
                .client
                .conn
                .put_copy_end(Some(ABANDONED), |_| {});
        }
    }
}

/// Reads egress COPY data chunk by chunk. Dropping it early cancels the COPY.
pub struct CopyOutReader<'a, S: Session> {
    client: &'a Client<S>,
    _guard: MutexGuard<'a, ()>,
    events: mpsc::UnboundedReceiver<CopyEvent>,
    chunk_size: usize,
    done: bool,
}

impl<S: Session> CopyOutReader<'_, S> {
    /// Pull size for subsequent reads.
    pub fn set_chunk_size(&mut self, size: usize) {
        self.chunk_size = size;
    }

    /// The next chunk, or `None` once the COPY has finished.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        if self.done {
            return Ok(None);
        }
        // A terminal event may already be queued behind the last chunk.
        if let Ok(event) = self.events.try_recv() {
            return self.accept(event);
        }
        self.client.conn.begin_egress(self.chunk_size)?;
        let event = loop {
            tokio::select! {
                event = self.events.recv() => break event,
                _ = self.client.poll_bridge() => {}
            }
        };
        match event {
            Some(event) => self.accept(event),
            None => {
                self.done = true;
                Err(Error::Closed)
            }
        }
    }

    /// Read the rest of the COPY into one buffer.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    fn accept(&mut self, event: CopyEvent) -> Result<Option<Bytes>> {
        match event {
            CopyEvent::Data(chunk) => Ok(Some(chunk)),
            CopyEvent::End => {
                self.done = true;
                Ok(None)
            }
            CopyEvent::Failed(e) => {
                self.done = true;
                Err(e)
            }
        }
    }
}

impl<S: Session> Drop for CopyOutReader<'_, S> {
    fn drop(&mut self) {
        if !self.done {
            let _ = self.client.conn.end_egress();
        }
    }
}
