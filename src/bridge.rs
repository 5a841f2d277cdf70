//! Cross-thread bridge between connection workers and the caller's thread.
//!
//! Workers never run completion logic themselves. When a blocking call
//! finishes, the worker posts its connection (or COPY pump) onto the shared
//! ready-list and wakes the caller. The caller drains the whole list on every
//! wake, in posting order, and runs each entry's completion on its own thread.
//!
//! One bridge is typically shared by every connection owned by a caller.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;
use tracing::trace;

/// An entry on the ready-list. `on_ready` runs on the draining thread.
pub(crate) trait Ready: Send + Sync {
    fn on_ready(self: Arc<Self>);
}

struct Shared {
    ready: Mutex<VecDeque<Arc<dyn Ready>>>,
    /// Wakes a caller blocked in [`Bridge::wait`].
    signal: Condvar,
    /// Wakes a caller awaiting [`Bridge::turn`].
    notify: Notify,
}

/// Handle to a ready-list; cloning shares the same list.
#[derive(Clone)]
pub struct Bridge {
    shared: Arc<Shared>,
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new()
    }
}

impl Bridge {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                ready: Mutex::new(VecDeque::new()),
                signal: Condvar::new(),
                notify: Notify::new(),
            }),
        }
    }

    /// Append an entry and wake the caller. Called from worker threads.
    pub(crate) fn post(&self, entry: Arc<dyn Ready>) {
        self.shared.ready.lock().push_back(entry);
        self.shared.signal.notify_all();
        // Wake every task currently in `turn`, and leave a permit for one
        // that is about to start waiting.
        self.shared.notify.notify_waiters();
        self.shared.notify.notify_one();
    }

    /// Number of entries waiting to be drained.
    pub fn pending(&self) -> usize {
        self.shared.ready.lock().len()
    }

    /// Run every entry currently on the ready-list, oldest first, and return
    /// how many ran. Never blocks. Entries posted while draining are left for
    /// the next call.
    pub fn drain(&self) -> usize {
        let batch = std::mem::take(&mut *self.shared.ready.lock());
        let count = batch.len();
        if count > 0 {
            trace!(entries = count, "draining bridge");
        }
        for entry in batch {
            entry.on_ready();
        }
        count
    }

    /// Block until at least one entry is ready or `timeout` elapses, then
    /// drain. Returns the number of entries run.
    pub fn wait(&self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        {
            let mut ready = self.shared.ready.lock();
            while ready.is_empty() {
                if self
                    .shared
                    .signal
                    .wait_until(&mut ready, deadline)
                    .timed_out()
                {
                    break;
                }
            }
        }
        self.drain()
    }

    /// Await the next wake and drain. Returns once at least one entry ran.
    pub async fn turn(&self) -> usize {
        loop {
            let ran = self.drain();
            if ran > 0 {
                return ran;
            }
            self.shared.notify.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    struct Probe {
        id: usize,
        log: Arc<Mutex<Vec<usize>>>,
    }

    impl Ready for Probe {
        fn on_ready(self: Arc<Self>) {
            self.log.lock().push(self.id);
        }
    }

    /// Re-posts itself once from inside its own completion.
    struct Repost {
        bridge: Bridge,
        runs: AtomicUsize,
    }

    impl Ready for Repost {
        fn on_ready(self: Arc<Self>) {
            if self.runs.fetch_add(1, Ordering::SeqCst) == 0 {
                self.bridge.post(self.clone());
            }
        }
    }

    #[test]
    fn test_drain_runs_whole_list_in_order() {
        let bridge = Bridge::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for id in 0..4 {
            bridge.post(Arc::new(Probe {
                id,
                log: log.clone(),
            }));
        }
        assert_eq!(bridge.pending(), 4);
        assert_eq!(bridge.drain(), 4);
        assert_eq!(*log.lock(), vec![0, 1, 2, 3]);
        assert_eq!(bridge.drain(), 0);
    }

    #[test]
    fn test_entry_posted_during_drain_waits_for_next_drain() {
        let bridge = Bridge::new();
        let entry = Arc::new(Repost {
            bridge: bridge.clone(),
            runs: AtomicUsize::new(0),
        });
        bridge.post(entry.clone());
        assert_eq!(bridge.drain(), 1);
        assert_eq!(bridge.pending(), 1);
        assert_eq!(bridge.drain(), 1);
        assert_eq!(entry.runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_wait_wakes_on_post_from_other_thread() {
        let bridge = Bridge::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let poster = {
            let bridge = bridge.clone();
            let log = log.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                bridge.post(Arc::new(Probe { id: 7, log }));
            })
        };
        let mut ran = 0;
        while ran == 0 {
            ran = bridge.wait(Duration::from_secs(5));
        }
        poster.join().unwrap();
        assert_eq!(*log.lock(), vec![7]);
    }

    #[test]
    fn test_wait_times_out_empty() {
        let bridge = Bridge::new();
        assert_eq!(bridge.wait(Duration::from_millis(10)), 0);
    }

    #[tokio::test]
    async fn test_turn_wakes_on_post() {
        let bridge = Bridge::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let poster = {
            let bridge = bridge.clone();
            let log = log.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                bridge.post(Arc::new(Probe { id: 1, log }));
            })
        };
        assert_eq!(bridge.turn().await, 1);
        poster.join().unwrap();
        assert_eq!(*log.lock(), vec![1]);
    }
}
