//! Reference counting of in-flight requests.
//!
//! The worker process is "referenced" while at least one request is
//! outstanding. Only the 0→1 and 1→0 transitions reach the process hook, so a
//! burst of concurrent calls toggles it once.

use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::error::LockResultExt;

/// Hook toggled when the outstanding-request count leaves or reaches zero.
pub trait ProcessRef: Send + Sync {
    fn ref_process(&self);
    fn unref_process(&self);
}

/// Counter over outstanding requests.
pub struct KeepAlive {
    count: Mutex<usize>,
    process: Arc<dyn ProcessRef>,
}

impl KeepAlive {
    pub fn new(process: Arc<dyn ProcessRef>) -> Self {
        Self {
            count: Mutex::new(0),
            process,
        }
    }

    pub fn add_ref(&self) {
        // The hook runs under the lock so transitions reach it in order.
        let mut count = self.count.lock().recover_poison("KeepAlive::add_ref");
        *count += 1;
        if *count == 1 {
            self.process.ref_process();
        }
    }

    pub fn unref(&self) {
        let mut count = self.count.lock().recover_poison("KeepAlive::unref");
        match *count {
            0 => {
                log::warn!(
                    target: "tsunagi::service::keep_alive",
                    "unref with no outstanding references"
                );
            }
            1 => {
                *count = 0;
                self.process.unref_process();
            }
            _ => *count -= 1,
        }
    }

    pub fn count(&self) -> usize {
        *self.count.lock().recover_poison("KeepAlive::count")
    }

    /// Take a reference that is released when the guard drops.
    pub fn acquire(self: &Arc<Self>) -> KeepAliveRef {
        self.add_ref();
        KeepAliveRef {
            keep_alive: Arc::clone(self),
        }
    }
}

impl std::fmt::Debug for KeepAlive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeepAlive")
            .field("count", &self.count())
            .finish()
    }
}

/// RAII reference held by a pending request.
#[derive(Debug)]
pub struct KeepAliveRef {
    keep_alive: Arc<KeepAlive>,
}

impl Drop for KeepAliveRef {
    fn drop(&mut self) {
        self.keep_alive.unref();
    }
}

/// Default process hook: a watchable "referenced" flag.
///
/// Starts un-referenced. The idle reaper subscribes to it to learn when the
/// worker has had nothing to do.
#[derive(Debug)]
pub struct ReferenceFlag {
    tx: watch::Sender<bool>,
}

impl ReferenceFlag {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn is_referenced(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for ReferenceFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRef for ReferenceFlag {
    fn ref_process(&self) {
        self.tx.send_replace(true);
    }

    fn unref_process(&self) {
        self.tx.send_replace(false);
    }
}
