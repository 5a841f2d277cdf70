//! Egress COPY pump.
//!
//! The pump thread borrows the session from the connection for the whole
//! COPY and is gated by a counting semaphore: one permit per pull. For each
//! permit it assembles a chunk of at most the requested size, first from the
//! bytes held over from the previous read, then from fresh reads, and posts
//! it to the bridge.
//!
//! The lifecycle flag moves `Idle -> Delivering` when a chunk is handed off
//! and back to `Idle` once the caller has dispatched it. `Closed` means the
//! consumer ended the COPY or the connection was closed: a pending delivery
//! is dropped, the pump unwinds, and the session goes back to the connection
//! only after the pump has been joined.

use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use bytes::{Bytes, BytesMut};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use super::{Consumer, CopyEvent};
use crate::bridge::{Bridge, Ready};
use crate::connection::{Connection, Core, Inner, Outcome};
use crate::error::{Error, Result};
use crate::session::{CancelSignal, CopyData, Operation, Session};
use crate::state::{ConnState, CopyMode};
use crate::types::{encode, Value};

/// Counting semaphore gating the pump.
struct Permits {
    count: Mutex<usize>,
    available: Condvar,
}

impl Permits {
    fn new() -> Self {
        Self {
            count: Mutex::new(0),
            available: Condvar::new(),
        }
    }

    fn release(&self) {
        *self.count.lock() += 1;
        self.available.notify_one();
    }

    fn acquire(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.available.wait(&mut count);
        }
        *count -= 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pull {
    /// Read at most this many bytes.
    Bytes(usize),
    /// Stop pumping.
    Unwind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Delivering,
    Closed,
}

/// A chunk handed from the pump to the caller's thread.
struct Delivery {
    chunk: Bytes,
    /// Set on the last delivery of the stream.
    end: Option<Result<()>>,
}

struct EgressState<S> {
    pull: Pull,
    phase: Phase,
    /// A permit was released and its chunk not yet dispatched.
    requested: bool,
    delivery: Option<Delivery>,
    consumer: Option<Consumer>,
    worker: Option<JoinHandle<()>>,
    started: bool,
    /// The borrowed session: parked here until the pump picks it up, and
    /// handed back here when the pump exits.
    session: Option<S>,
    exited: bool,
    terminal_sent: bool,
    aborted: bool,
    finalized: bool,
}

pub(crate) struct Egress<S: Session> {
    conn: Weak<Inner<S>>,
    conn_id: u64,
    worker_name: String,
    bridge: Bridge,
    cancel: Option<Arc<dyn CancelSignal>>,
    permits: Permits,
    state: Mutex<EgressState<S>>,
}

impl<S: Session> Egress<S> {
    pub(crate) fn new(
        conn: &Arc<Inner<S>>,
        cancel: Option<Arc<dyn CancelSignal>>,
        consumer: Option<Consumer>,
    ) -> Arc<Self> {
        Arc::new(Self {
            conn: Arc::downgrade(conn),
            conn_id: conn.id,
            worker_name: conn.config.worker_name.clone(),
            bridge: conn.bridge.clone(),
            cancel,
            permits: Permits::new(),
            state: Mutex::new(EgressState {
                pull: Pull::Bytes(0),
                phase: Phase::Idle,
                requested: false,
                delivery: None,
                consumer,
                worker: None,
                started: false,
                session: None,
                exited: false,
                terminal_sent: false,
                aborted: false,
                finalized: false,
            }),
        })
    }

    /// Start the pump on first use, moving the session out of the
    /// connection. Called with the connection's core locked.
    fn ensure_started(self: &Arc<Self>, core: &mut Core<S>) -> Result<()> {
        let mut st = self.state.lock();
        if st.started {
            return Ok(());
        }
        if core.session.is_none() {
            return Err(Error::Closed);
        }
        // The session only leaves the connection once the thread exists; the
        // pump cannot take it before this lock is released.
        let egress = self.clone();
        let handle = thread::Builder::new()
            .name(format!("{}-copy-{}", self.worker_name, self.conn_id))
            .spawn(move || pump(egress))?;
        st.session = core.session.take();
        st.worker = Some(handle);
        st.started = true;
        debug!(conn = self.conn_id, "COPY pump started");
        Ok(())
    }

    fn request(&self, pull: Pull) {
        let mut st = self.state.lock();
        match pull {
            Pull::Bytes(max) => {
                if st.phase == Phase::Closed || st.terminal_sent {
                    return;
                }
                trace!(conn = self.conn_id, max, "egress pull");
                st.pull = pull;
                if !st.requested {
                    st.requested = true;
                    self.permits.release();
                }
            }
            Pull::Unwind => {
                st.pull = pull;
                if st.phase != Phase::Closed {
                    debug!(conn = self.conn_id, "egress ended by consumer");
                    st.phase = Phase::Closed;
                    self.permits.release();
                }
            }
        }
    }

    /// The connection was closed while this COPY was open. The caller has
    /// already sent the cancel request.
    pub(crate) fn abort(self: &Arc<Self>) {
        let mut st = self.state.lock();
        st.aborted = true;
        st.pull = Pull::Unwind;
        let was_open = st.phase != Phase::Closed;
        st.phase = Phase::Closed;
        if st.started {
            if was_open {
                self.permits.release();
            }
        } else {
            drop(st);
            self.bridge.post(self.clone());
        }
    }

    /// Stop an unfinished COPY so the session is usable again.
    fn cancel_and_drain(&self, session: &mut S) {
        if let Some(cancel) = &self.cancel {
            if let Err(e) = cancel.cancel() {
                warn!(conn = self.conn_id, error = %e, "cancel request failed");
            }
        }
        loop {
            match session.get_copy_data() {
                CopyData::Row(_) => {}
                CopyData::Done => break,
                CopyData::Failed(e) => {
                    trace!(conn = self.conn_id, error = %e, "COPY ended after cancel");
                    break;
                }
            }
        }
    }
}

fn pump<S: Session>(egress: Arc<Egress<S>>) {
    let session = egress.state.lock().session.take();
    let Some(mut session) = session else {
        egress.state.lock().exited = true;
        egress.bridge.post(egress.clone());
        return;
    };
    let mut held = Bytes::new();
    let mut finished: Option<Result<()>> = None;
    let mut complete = false;

    loop {
        egress.permits.acquire();
        let max = match egress.state.lock().pull {
            Pull::Unwind => break,
            Pull::Bytes(max) => max,
        };

        let mut chunk = BytesMut::with_capacity(max.min(64 * 1024));
        let take = held.len().min(max);
        chunk.extend_from_slice(&held.split_to(take));
        while chunk.len() < max && !complete {
            match session.get_copy_data() {
                CopyData::Row(mut row) => {
                    let room = max - chunk.len();
                    if row.len() > room {
                        held = row.split_off(room);
                    }
                    chunk.extend_from_slice(&row);
                }
                CopyData::Done => {
                    finished = Some(Ok(()));
                    complete = true;
                }
                CopyData::Failed(e) => {
                    finished = Some(Err(e));
                    complete = true;
                }
            }
        }

        let end = if held.is_empty() { finished.take() } else { None };
        let terminal = end.is_some();
        trace!(conn = egress.conn_id, bytes = chunk.len(), terminal, "egress chunk");
        {
            let mut st = egress.state.lock();
            if st.phase == Phase::Closed {
                break;
            }
            st.phase = Phase::Delivering;
            st.delivery = Some(Delivery {
                chunk: chunk.freeze(),
                end,
            });
        }
        egress.bridge.post(egress.clone());
        if terminal {
            break;
        }
    }

    let aborted = egress.state.lock().aborted;
    if !complete && !aborted {
        egress.cancel_and_drain(&mut session);
    }

    {
        let mut st = egress.state.lock();
        st.session = Some(session);
        st.exited = true;
    }
    egress.bridge.post(egress.clone());
}

impl<S: Session> Ready for Egress<S> {
    fn on_ready(self: Arc<Self>) {
        let mut events = Vec::with_capacity(2);
        let mut st = self.state.lock();
        if st.finalized {
            return;
        }

        let mut terminal_now = false;
        if let Some(delivery) = st.delivery.take() {
            if st.phase == Phase::Delivering {
                st.phase = Phase::Idle;
                st.requested = false;
                if !delivery.chunk.is_empty() {
                    events.push(CopyEvent::Data(delivery.chunk));
                }
                if let Some(end) = delivery.end {
                    terminal_now = true;
                    st.terminal_sent = true;
                    events.push(match end {
                        Ok(()) => CopyEvent::End,
                        Err(e) => CopyEvent::Failed(e),
                    });
                }
            } else {
                trace!(conn = self.conn_id, "dropping chunk delivered after close");
            }
        }

        // After the terminal chunk the pump exits without further reads, so
        // joining it here is brief and lets `End` observe a READY connection.
        let finalize = st.exited || terminal_now || (st.aborted && !st.started);
        let worker = if finalize {
            st.finalized = true;
            st.worker.take()
        } else {
            None
        };
        let mut consumer = st.consumer.take();
        drop(st);

        if finalize {
            if let Some(worker) = worker {
                if worker.join().is_err() {
                    warn!(conn = self.conn_id, "COPY pump panicked");
                }
            }
            let (session, terminal_sent) = {
                let mut st = self.state.lock();
                (st.session.take(), st.terminal_sent)
            };
            let closed = match self.conn.upgrade() {
                Some(conn) => conn.end_copy_out(session),
                None => {
                    if let Some(session) = session {
                        session.finish();
                    }
                    true
                }
            };
            if !terminal_sent {
                events.push(if closed {
                    CopyEvent::Failed(Error::Closed)
                } else {
                    CopyEvent::End
                });
            }
        }

        if let Some(consumer) = consumer.as_mut() {
            for event in events {
                consumer(event);
            }
        }
        if !finalize {
            self.state.lock().consumer = consumer;
        }
    }
}

impl<S: Session> Connection<S> {
    /// Issue a `COPY ... TO STDOUT` command. `consumer` receives the data
    /// once pulls are requested with [`begin_egress`](Self::begin_egress).
    pub fn copy_to(
        &self,
        command: &str,
        params: Option<&[Value]>,
        consumer: impl FnMut(CopyEvent) + Send + 'static,
        callback: impl FnOnce(Result<Outcome>) + Send + 'static,
    ) -> Result<()> {
        self.submit_with_consumer(
            Operation::CopyTo {
                command: command.to_string(),
                params: params.map(|p| p.iter().map(encode::to_sql).collect()),
            },
            Box::new(consumer),
            Box::new(callback),
        )
    }

    /// Request the next chunk of at most `max_bytes`. Repeat after each
    /// `CopyEvent::Data`. Requesting again before the previous chunk arrived
    /// only updates the size.
    pub fn begin_egress(&self, max_bytes: usize) -> Result<()> {
        if max_bytes == 0 {
            return Err(Error::InvalidArgument(
                "egress chunk size must be positive".to_string(),
            ));
        }
        let egress = {
            let mut core = self.inner.core.lock();
            if core.state != ConnState::Ready {
                return Err(Error::state("READY", core.state.as_str()));
            }
            let egress = match (core.copy, core.egress.clone()) {
                (CopyMode::Out, Some(egress)) => egress,
                (mode, _) => return Err(Error::state(CopyMode::Out.as_str(), mode.as_str())),
            };
            egress.ensure_started(&mut core)?;
            egress
        };
        egress.request(Pull::Bytes(max_bytes));
        Ok(())
    }

    /// Stop the egress COPY early. The server is sent a cancel request, the
    /// remaining data is discarded and the consumer receives `End` once the
    /// connection is `READY` again. A no-op when no egress COPY is open.
    pub fn end_egress(&self) -> Result<()> {
        let egress = {
            let mut core = self.inner.core.lock();
            if core.state != ConnState::Ready || core.copy != CopyMode::Out {
                return Ok(());
            }
            let Some(egress) = core.egress.clone() else {
                return Ok(());
            };
            egress.ensure_started(&mut core)?;
            egress
        };
        egress.request(Pull::Unwind);
        Ok(())
    }
}
