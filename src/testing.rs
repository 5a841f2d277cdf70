//! Scripted in-memory session for driving the engine without a server.
//!
//! Every blocking call can be held at a gate so a test observes `BUSY`
//! deterministically; a cancel request opens the gate and fails the held
//! call with SQLSTATE 57014, as a server would.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::bridge::Bridge;
use crate::config::ConnectionConfig;
use crate::connection::{Connection, Outcome};
use crate::error::{Error, Result, ServerError};
use crate::session::{CancelSignal, Column, CopyData, Reply, Session};
use crate::types::Oid;

pub(crate) const QUERY_CANCELED: &str = "57014";

#[derive(Default)]
pub(crate) struct Script {
    replies: VecDeque<Result<Reply>>,
    copy_rows: VecDeque<CopyData>,
    connect_error: Option<String>,
    held: bool,
    in_call: bool,
    cancel_requested: bool,
    cancel_fails: bool,
    pub cancels: usize,
    pub calls: Vec<String>,
    pub copied_in: Vec<u8>,
    pub copy_reads: usize,
    pub finished: usize,
}

struct Shared {
    script: Mutex<Script>,
    gate: Condvar,
}

/// Test-side handle to the script shared with the session.
#[derive(Clone)]
pub(crate) struct Mock {
    shared: Arc<Shared>,
}

impl Mock {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                script: Mutex::new(Script::default()),
                gate: Condvar::new(),
            }),
        }
    }

    pub fn script(&self) -> MutexGuard<'_, Script> {
        self.shared.script.lock()
    }

    pub fn reply(&self, reply: Result<Reply>) -> &Self {
        self.script().replies.push_back(reply);
        self
    }

    pub fn copy_rows<I: IntoIterator<Item = &'static str>>(&self, rows: I) -> &Self {
        self.script()
            .copy_rows
            .extend(rows.into_iter().map(|r| CopyData::Row(Bytes::from_static(r.as_bytes()))));
        self
    }

    pub fn copy_fails(&self, error: Error) -> &Self {
        self.script().copy_rows.push_back(CopyData::Failed(error));
        self
    }

    pub fn fail_connect(&self, message: &str) -> &Self {
        self.script().connect_error = Some(message.to_string());
        self
    }

    pub fn fail_cancel(&self) -> &Self {
        self.script().cancel_fails = true;
        self
    }

    /// Block every subsequent call until [`release`](Self::release) or a
    /// cancel request.
    pub fn hold(&self) {
        self.script().held = true;
    }

    pub fn release(&self) {
        self.script().held = false;
        self.shared.gate.notify_all();
    }

    /// Whether a call is currently blocked at the gate.
    pub fn in_call(&self) -> bool {
        self.script().in_call
    }

    pub fn cancels(&self) -> usize {
        self.script().cancels
    }

    pub fn finished(&self) -> usize {
        self.script().finished
    }

    pub fn calls(&self) -> Vec<String> {
        self.script().calls.clone()
    }

    pub fn connector(&self) -> impl FnOnce(&str) -> Result<MockSession> + Send + 'static {
        let mock = self.clone();
        move |conninfo| {
            mock.enter(format!("connect {conninfo}"))?;
            if let Some(message) = mock.script().connect_error.take() {
                return Err(Error::Transport(message));
            }
            Ok(MockSession { mock })
        }
    }

    /// Record a call and wait at the gate.
    fn enter(&self, call: String) -> Result<()> {
        let mut script = self.script();
        script.calls.push(call);
        script.in_call = true;
        while script.held && !script.cancel_requested {
            self.shared.gate.wait(&mut script);
        }
        script.in_call = false;
        if script.cancel_requested {
            script.cancel_requested = false;
            return Err(canceled());
        }
        Ok(())
    }

    fn next_reply(&self, default: Reply) -> Result<Reply> {
        self.script().replies.pop_front().unwrap_or(Ok(default))
    }
}

pub(crate) fn canceled() -> Error {
    Error::Server(ServerError::new(
        "ERROR",
        QUERY_CANCELED,
        "canceling statement due to user request",
    ))
}

pub(crate) struct MockSession {
    mock: Mock,
}

impl Session for MockSession {
    fn exec(&mut self, command: &str, params: Option<&[Option<String>]>) -> Result<Reply> {
        let call = match params {
            None => format!("exec {command}"),
            Some(params) => format!("exec {command} {params:?}"),
        };
        self.mock.enter(call)?;
        self.mock.next_reply(Reply::Command { rows: None })
    }

    fn prepare(&mut self, name: &str, command: &str) -> Result<Reply> {
        self.mock.enter(format!("prepare {name} {command}"))?;
        self.mock.next_reply(Reply::Command { rows: None })
    }

    fn exec_prepared(&mut self, name: &str, params: &[Option<String>]) -> Result<Reply> {
        self.mock.enter(format!("execPrepared {name} {params:?}"))?;
        self.mock.next_reply(Reply::Command { rows: None })
    }

    fn put_copy_data(&mut self, data: &[u8]) -> Result<()> {
        self.mock.enter("putCopyData".to_string())?;
        self.mock.script().copied_in.extend_from_slice(data);
        Ok(())
    }

    fn put_copy_end(&mut self, error: Option<&str>) -> Result<Reply> {
        self.mock.enter(format!("putCopyEnd {error:?}"))?;
        if let Some(message) = error {
            self.mock.script().copied_in.clear();
            return Err(Error::Server(ServerError::new(
                "ERROR",
                QUERY_CANCELED,
                &format!("COPY from stdin failed: {message}"),
            )));
        }
        let lines = self
            .mock
            .script()
            .copied_in
            .iter()
            .filter(|&&b| b == b'\n')
            .count();
        self.mock.next_reply(Reply::Command {
            rows: Some(lines as u64),
        })
    }

    fn get_copy_data(&mut self) -> CopyData {
        let mut script = self.mock.script();
        script.copy_reads += 1;
        script.in_call = true;
        while script.held && !script.cancel_requested {
            self.mock.shared.gate.wait(&mut script);
        }
        script.in_call = false;
        if script.cancel_requested {
            script.cancel_requested = false;
            script.copy_rows.clear();
            return CopyData::Failed(canceled());
        }
        script.copy_rows.pop_front().unwrap_or(CopyData::Done)
    }

    fn cancel_signal(&self) -> Option<Arc<dyn CancelSignal>> {
        Some(Arc::new(MockCancel {
            mock: self.mock.clone(),
        }))
    }

    fn finish(self) {
        self.mock.script().finished += 1;
    }
}

struct MockCancel {
    mock: Mock,
}

impl CancelSignal for MockCancel {
    fn cancel(&self) -> Result<()> {
        let mut script = self.mock.script();
        script.cancels += 1;
        if script.cancel_fails {
            return Err(Error::Transport("could not send cancel request".to_string()));
        }
        script.cancel_requested = true;
        self.mock.shared.gate.notify_all();
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

const DEADLINE: Duration = Duration::from_secs(5);

/// Drain the bridge until `done` holds.
pub(crate) fn drive(bridge: &Bridge, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + DEADLINE;
    while !done() {
        assert!(Instant::now() < deadline, "timed out driving the bridge");
        bridge.wait(Duration::from_millis(10));
    }
}

/// Spin until `cond` holds, without draining.
pub(crate) fn until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + DEADLINE;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting");
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Receives one completion.
#[derive(Clone, Default)]
pub(crate) struct Slot {
    inner: Arc<Mutex<Option<Result<Outcome>>>>,
}

impl Slot {
    pub fn callback(&self) -> impl FnOnce(Result<Outcome>) + Send + 'static {
        let inner = self.inner.clone();
        move |result| {
            let previous = inner.lock().replace(result);
            assert!(previous.is_none(), "callback invoked twice");
        }
    }

    pub fn is_set(&self) -> bool {
        self.inner.lock().is_some()
    }

    pub fn take(&self) -> Result<Outcome> {
        self.inner.lock().take().expect("completion not delivered")
    }

    /// Drain until the completion arrives and return it.
    pub fn wait(&self, bridge: &Bridge) -> Result<Outcome> {
        drive(bridge, || self.is_set());
        self.take()
    }
}

/// Open a connection and drive it to `READY`.
pub(crate) fn connect(bridge: &Bridge, mock: &Mock) -> Connection<MockSession> {
    let slot = Slot::default();
    let conn = Connection::open(
        bridge,
        ConnectionConfig::new("dbname=test"),
        mock.connector(),
        slot.callback(),
    )
    .unwrap();
    assert_eq!(slot.wait(bridge).unwrap(), Outcome::Done);
    conn
}

pub(crate) fn rows(columns: &[(&str, Oid)], rows: &[&[Option<&str>]]) -> Reply {
    Reply::Rows {
        columns: columns
            .iter()
            .map(|(name, oid)| Column::new(*name, *oid))
            .collect(),
        rows: rows
            .iter()
            .map(|row| {
                row.iter()
                    .map(|cell| cell.map(|c| Bytes::copy_from_slice(c.as_bytes())))
                    .collect()
            })
            .collect(),
    }
}
