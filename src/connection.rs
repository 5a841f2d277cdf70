//! Connection dispatch engine.
//!
//! Each [`Connection`] owns one dedicated worker thread, the only thread that
//! ever makes a blocking call on the [`Session`]. Submission happens on the
//! caller's thread and never blocks:
//!
//! 1. `submit` validates the state (`READY`, no COPY), moves to `BUSY`, stores
//!    the request and wakes the worker.
//! 2. The worker takes the session, performs exactly one blocking call with
//!    the core lock released, stores the reply and posts the connection onto
//!    the [`Bridge`].
//! 3. The caller drains the bridge; completion materializes the reply, flips
//!    the state back to `READY` and invokes the callback.
//!
//! Closing a busy connection moves it to `ABORT` and sends a cancel request;
//! the worker's call returns on its own and completion tears the connection
//! down instead of reusing it. Locks are never held across a blocking call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::bridge::{Bridge, Ready};
use crate::config::ConnectionConfig;
use crate::copy::egress::Egress;
use crate::copy::Consumer;
use crate::error::{Error, Result};
use crate::session::{CancelSignal, Column, Operation, Params, Reply, Session};
use crate::state::{ConnState, CopyMode};
use crate::types::{self, encode, Value};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Completion callback, invoked exactly once on the draining thread.
pub type Callback = Box<dyn FnOnce(Result<Outcome>) + Send>;

type Connector<S> = Box<dyn FnOnce(&str) -> Result<S> + Send>;

// ============================================================================
// Results
// ============================================================================

/// One result row: column name to decoded value. SQL-null cells are omitted.
pub type Row = HashMap<String, Value>;

/// Shared column descriptors of a result set.
pub type SharedColumns = Arc<Vec<Column>>;

#[derive(Debug, Clone, PartialEq)]
pub struct RowSet {
    pub columns: SharedColumns,
    pub rows: Vec<Row>,
}

/// The materialized result of one completed operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Acknowledged with nothing to report.
    Done,
    RowsAffected(u64),
    Rows(RowSet),
    /// A COPY is now open in the given direction.
    CopyStarted(CopyMode),
}

impl Outcome {
    pub fn rows(&self) -> Option<&RowSet> {
        match self {
            Outcome::Rows(set) => Some(set),
            _ => None,
        }
    }

    pub fn rows_affected(&self) -> Option<u64> {
        match self {
            Outcome::RowsAffected(n) => Some(*n),
            _ => None,
        }
    }
}

fn materialize(reply: Reply) -> Outcome {
    match reply {
        Reply::Empty | Reply::Command { rows: None } => Outcome::Done,
        Reply::Command { rows: Some(n) } => Outcome::RowsAffected(n),
        Reply::CopyIn => Outcome::CopyStarted(CopyMode::In),
        Reply::CopyOut => Outcome::CopyStarted(CopyMode::Out),
        Reply::Rows { columns, rows } => {
            let rows = rows
                .into_iter()
                .map(|cells| {
                    columns
                        .iter()
                        .zip(cells)
                        .filter_map(|(col, cell)| {
                            let text = cell?;
                            Some((col.name.clone(), types::decode(col.type_oid, &text)))
                        })
                        .collect()
                })
                .collect();
            Outcome::Rows(RowSet {
                columns: Arc::new(columns),
                rows,
            })
        }
    }
}

// ============================================================================
// Shared state
// ============================================================================

enum Request<S> {
    Connect(Connector<S>),
    Op(Operation),
}

/// What the in-flight request was, for interpreting its reply.
enum Pending {
    Connect,
    Command,
    CopyFrom,
    CopyTo,
    CopyData,
    CopyEnd(Option<String>),
}

impl Pending {
    fn of(op: &Operation) -> Self {
        match op {
            Operation::CopyFrom { .. } => Pending::CopyFrom,
            Operation::CopyTo { .. } => Pending::CopyTo,
            Operation::PutCopyData(_) => Pending::CopyData,
            Operation::PutCopyEnd { error } => Pending::CopyEnd(error.clone()),
            _ => Pending::Command,
        }
    }
}

pub(crate) struct Core<S: Session> {
    pub(crate) state: ConnState,
    pub(crate) copy: CopyMode,
    /// `None` while the worker (or COPY pump) holds it, and after teardown.
    pub(crate) session: Option<S>,
    pub(crate) cancel: Option<Arc<dyn CancelSignal>>,
    request: Option<Request<S>>,
    in_flight: Option<Pending>,
    reply: Option<Result<Reply>>,
    callback: Option<Callback>,
    /// Egress consumer waiting for its `COPY TO` command to complete.
    consumer: Option<Consumer>,
    pub(crate) egress: Option<Arc<Egress<S>>>,
    worker: Option<JoinHandle<()>>,
    shutdown: bool,
}

impl<S: Session> Core<S> {
    fn new() -> Self {
        Self {
            state: ConnState::Init,
            copy: CopyMode::None,
            session: None,
            cancel: None,
            request: None,
            in_flight: None,
            reply: None,
            callback: None,
            consumer: None,
            egress: None,
            worker: None,
            shutdown: false,
        }
    }
}

pub(crate) struct Inner<S: Session> {
    pub(crate) id: u64,
    pub(crate) config: ConnectionConfig,
    pub(crate) bridge: Bridge,
    pub(crate) core: Mutex<Core<S>>,
    wake: Condvar,
}

/// Resources released after the connection reaches `CLOSED`.
struct Teardown<S> {
    worker: Option<JoinHandle<()>>,
    session: Option<S>,
}

impl<S: Session> Inner<S> {
    pub(crate) fn transition(&self, core: &mut Core<S>, next: ConnState) {
        debug_assert!(
            core.state.can_transition(next),
            "illegal transition {} -> {}",
            core.state,
            next
        );
        debug!(conn = self.id, from = %core.state, to = %next, "state transition");
        core.state = next;
    }

    fn submit(&self, op: Operation, consumer: Option<Consumer>, callback: Callback) -> Result<()> {
        let mut core = self.core.lock();
        if core.state != ConnState::Ready {
            return Err(Error::state("READY", core.state.as_str()));
        }
        match (op.is_copy_in_chunk(), core.copy) {
            (true, CopyMode::In) | (false, CopyMode::None) => {}
            (true, mode) => return Err(Error::state(CopyMode::In.as_str(), mode.as_str())),
            (false, mode) => return Err(Error::state(CopyMode::None.as_str(), mode.as_str())),
        }
        if matches!(op, Operation::PutCopyEnd { .. }) {
            core.copy = CopyMode::None;
        }

        trace!(conn = self.id, op = op.name(), "submit");
        self.transition(&mut core, ConnState::Busy);
        core.in_flight = Some(Pending::of(&op));
        core.request = Some(Request::Op(op));
        core.callback = Some(callback);
        core.consumer = consumer;
        drop(core);
        self.wake.notify_one();
        Ok(())
    }

    /// Move to `CLOSED`, collecting what must be released outside the lock.
    fn begin_teardown(&self, core: &mut Core<S>) -> Teardown<S> {
        self.transition(core, ConnState::Closed);
        core.shutdown = true;
        core.copy = CopyMode::None;
        core.request = None;
        core.reply = None;
        core.consumer = None;
        core.egress = None;
        core.cancel = None;
        Teardown {
            worker: core.worker.take(),
            session: core.session.take(),
        }
    }

    /// Join the worker, then release the session. Caller thread only.
    fn finish_teardown(&self, teardown: Teardown<S>) {
        self.wake.notify_all();
        if let Some(worker) = teardown.worker {
            if worker.join().is_err() {
                warn!(conn = self.id, "worker thread panicked");
            }
        }
        if let Some(session) = teardown.session {
            session.finish();
        }
        debug!(conn = self.id, "connection closed");
    }

    pub(crate) fn send_cancel(&self, cancel: Option<Arc<dyn CancelSignal>>) {
        let Some(cancel) = cancel else {
            debug!(conn = self.id, "no cancel handle yet; waiting for the call to return");
            return;
        };
        if let Err(e) = cancel.cancel() {
            warn!(conn = self.id, error = %e, "cancel request failed");
        }
    }

    fn close(&self) {
        let mut core = self.core.lock();
        let state = core.state;
        match state {
            ConnState::Closed | ConnState::Abort => {
                trace!(conn = self.id, state = %state, "close ignored");
            }
            ConnState::Busy => {
                self.transition(&mut core, ConnState::Abort);
                let cancel = core.cancel.clone();
                drop(core);
                self.send_cancel(cancel);
            }
            ConnState::Ready if core.egress.is_some() => {
                self.transition(&mut core, ConnState::Abort);
                let egress = core.egress.clone();
                let cancel = core.cancel.clone();
                drop(core);
                self.send_cancel(cancel);
                if let Some(egress) = egress {
                    egress.abort();
                }
            }
            ConnState::Init | ConnState::Ready | ConnState::Error => {
                let cancel = if core.copy == CopyMode::In {
                    core.cancel.clone()
                } else {
                    None
                };
                let teardown = self.begin_teardown(&mut core);
                drop(core);
                if cancel.is_some() {
                    self.send_cancel(cancel);
                }
                self.finish_teardown(teardown);
            }
        }
    }

    /// Called by the egress pump's finalizer with the session it borrowed.
    /// Returns `true` when the connection was aborted meanwhile and has now
    /// been torn down.
    pub(crate) fn end_copy_out(&self, session: Option<S>) -> bool {
        let mut core = self.core.lock();
        core.egress = None;
        core.copy = CopyMode::None;
        if session.is_some() {
            core.session = session;
        }
        if core.state == ConnState::Abort {
            let teardown = self.begin_teardown(&mut core);
            drop(core);
            self.finish_teardown(teardown);
            true
        } else {
            debug!(conn = self.id, "COPY out finished");
            false
        }
    }

    /// Interpret a reply under the lock: update state and COPY mode.
    fn settle(
        self: &Arc<Self>,
        core: &mut Core<S>,
        pending: Option<Pending>,
        reply: Result<Reply>,
        consumer: Option<Consumer>,
    ) -> Result<Reply> {
        if matches!(pending, Some(Pending::Connect)) {
            let next = if reply.is_ok() {
                ConnState::Ready
            } else {
                ConnState::Error
            };
            self.transition(core, next);
            return reply;
        }

        self.transition(core, ConnState::Ready);
        if let Some(Pending::CopyEnd(Some(message))) = pending {
            // The server answers an aborted COPY with an error of its own.
            return match reply {
                Ok(_) | Err(Error::Server(_)) => Err(Error::CopyAborted(message)),
                Err(e) => Err(e),
            };
        }
        let reply = reply?;
        match (pending, reply) {
            (Some(Pending::CopyFrom), Reply::CopyIn) => self.start_copy_in(core),
            (Some(Pending::CopyTo), Reply::CopyOut) => self.start_copy_out(core, consumer),
            (Some(Pending::CopyFrom), _) => Err(Error::Protocol("Not a COPY_IN result".to_string())),
            (Some(Pending::CopyTo), _) => Err(Error::Protocol("Not a COPY_OUT result".to_string())),
            // A COPY issued through a plain exec.
            (_, Reply::CopyIn) => self.start_copy_in(core),
            (_, Reply::CopyOut) => self.start_copy_out(core, None),
            (Some(Pending::CopyData), _) => Ok(Reply::Empty),
            (_, reply) => Ok(reply),
        }
    }

    fn start_copy_in(&self, core: &mut Core<S>) -> Result<Reply> {
        debug!(conn = self.id, "COPY in started");
        core.copy = CopyMode::In;
        Ok(Reply::CopyIn)
    }

    fn start_copy_out(
        self: &Arc<Self>,
        core: &mut Core<S>,
        consumer: Option<Consumer>,
    ) -> Result<Reply> {
        debug!(conn = self.id, "COPY out started");
        core.copy = CopyMode::Out;
        core.egress = Some(Egress::new(self, core.cancel.clone(), consumer));
        Ok(Reply::CopyOut)
    }
}

impl<S: Session> Ready for Inner<S> {
    fn on_ready(self: Arc<Self>) {
        let mut core = self.core.lock();
        let Some(reply) = core.reply.take() else {
            return;
        };
        let pending = core.in_flight.take();
        let callback = core.callback.take();
        let consumer = core.consumer.take();

        if core.state == ConnState::Abort {
            let teardown = self.begin_teardown(&mut core);
            drop(core);
            self.finish_teardown(teardown);
            if let Some(callback) = callback {
                callback(Err(Error::Closed));
            }
            return;
        }

        let result = self.settle(&mut core, pending, reply, consumer);
        drop(core);

        let result = result.map(materialize);
        if let Some(callback) = callback {
            callback(result);
        }
    }
}

fn worker_loop<S: Session>(inner: Arc<Inner<S>>) {
    loop {
        let (request, session) = {
            let mut core = inner.core.lock();
            loop {
                if core.shutdown {
                    return;
                }
                if let Some(request) = core.request.take() {
                    let session = core.session.take();
                    break (request, session);
                }
                inner.wake.wait(&mut core);
            }
        };

        let (session, reply) = match request {
            Request::Connect(connect) => match connect(&inner.config.conninfo) {
                Ok(session) => (Some(session), Ok(Reply::Empty)),
                Err(e) => (None, Err(e)),
            },
            Request::Op(op) => match session {
                Some(mut session) => {
                    let reply = op.run(&mut session);
                    (Some(session), reply)
                }
                None => (None, Err(Error::Closed)),
            },
        };

        {
            let mut core = inner.core.lock();
            if let Some(session) = &session {
                if core.cancel.is_none() {
                    core.cancel = session.cancel_signal();
                }
            }
            core.session = session;
            core.reply = Some(reply);
        }
        inner.bridge.post(inner.clone());
    }
}

// ============================================================================
// Connection
// ============================================================================

/// One physical connection driven asynchronously through a [`Bridge`].
///
/// Dropping the connection closes it.
pub struct Connection<S: Session> {
    pub(crate) inner: Arc<Inner<S>>,
}

impl<S: Session> Connection<S> {
    /// Spawn the worker and submit the connect request.
    ///
    /// `connector` runs on the worker with the configured conninfo. The
    /// callback receives `Outcome::Done` once the connection is `READY`, or
    /// the connect error (the connection is then in `ERROR`).
    pub fn open<F>(
        bridge: &Bridge,
        config: ConnectionConfig,
        connector: F,
        callback: impl FnOnce(Result<Outcome>) + Send + 'static,
    ) -> Result<Self>
    where
        F: FnOnce(&str) -> Result<S> + Send + 'static,
    {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-{}", config.worker_name, id);
        let inner = Arc::new(Inner {
            id,
            config,
            bridge: bridge.clone(),
            core: Mutex::new(Core::new()),
            wake: Condvar::new(),
        });

        let worker = {
            let inner = inner.clone();
            thread::Builder::new()
                .name(name)
                .spawn(move || worker_loop(inner))?
        };

        let mut core = inner.core.lock();
        core.worker = Some(worker);
        inner.transition(&mut core, ConnState::Busy);
        core.in_flight = Some(Pending::Connect);
        core.request = Some(Request::Connect(Box::new(connector)));
        core.callback = Some(Box::new(callback));
        drop(core);
        inner.wake.notify_one();

        Ok(Self { inner })
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnState {
        self.inner.core.lock().state
    }

    pub fn copy_mode(&self) -> CopyMode {
        self.inner.core.lock().copy
    }

    /// `READY` with no COPY open.
    pub fn is_ready(&self) -> bool {
        let core = self.inner.core.lock();
        core.state == ConnState::Ready && core.copy == CopyMode::None
    }

    /// Submit an operation. Fails synchronously with [`Error::State`] unless
    /// the connection is `READY`; the callback is then never invoked.
    pub fn submit(
        &self,
        op: Operation,
        callback: impl FnOnce(Result<Outcome>) + Send + 'static,
    ) -> Result<()> {
        self.inner.submit(op, None, Box::new(callback))
    }

    pub(crate) fn submit_with_consumer(
        &self,
        op: Operation,
        consumer: Consumer,
        callback: Callback,
    ) -> Result<()> {
        self.inner.submit(op, Some(consumer), callback)
    }

    pub fn exec(
        &self,
        command: &str,
        callback: impl FnOnce(Result<Outcome>) + Send + 'static,
    ) -> Result<()> {
        self.submit(
            Operation::Exec {
                command: command.to_string(),
                params: None,
            },
            callback,
        )
    }

    pub fn exec_params(
        &self,
        command: &str,
        params: &[Value],
        callback: impl FnOnce(Result<Outcome>) + Send + 'static,
    ) -> Result<()> {
        self.submit(
            Operation::Exec {
                command: command.to_string(),
                params: Some(bind(params)),
            },
            callback,
        )
    }

    pub fn prepare(
        &self,
        name: &str,
        command: &str,
        callback: impl FnOnce(Result<Outcome>) + Send + 'static,
    ) -> Result<()> {
        self.submit(
            Operation::Prepare {
                name: name.to_string(),
                command: command.to_string(),
            },
            callback,
        )
    }

    pub fn exec_prepared(
        &self,
        name: &str,
        params: &[Value],
        callback: impl FnOnce(Result<Outcome>) + Send + 'static,
    ) -> Result<()> {
        self.submit(
            Operation::ExecPrepared {
                name: name.to_string(),
                params: bind(params),
            },
            callback,
        )
    }

    /// Send a cancel request for whatever is running, without closing.
    /// A no-op when idle.
    pub fn cancel(&self) {
        let cancel = {
            let core = self.inner.core.lock();
            let running = core.state == ConnState::Busy
                || (core.state == ConnState::Ready && core.copy.in_progress());
            if !running {
                return;
            }
            core.cancel.clone()
        };
        self.inner.send_cancel(cancel);
    }

    /// Close the connection. Idempotent.
    ///
    /// Idle connections are released immediately. A busy connection, or one
    /// streaming COPY data out, is cancelled and moves to `ABORT`; it reaches
    /// `CLOSED` once the worker's call has returned, and the pending callback
    /// receives [`Error::Closed`].
    pub fn close(&self) {
        self.inner.close();
    }
}

impl<S: Session> Drop for Connection<S> {
    fn drop(&mut self) {
        self.inner.close();
    }
}

fn bind(params: &[Value]) -> Params {
    params.iter().map(encode::to_sql).collect()
}
