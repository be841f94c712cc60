//! Ownership of the current worker process.
//!
//! A [`ServiceManager`] holds at most one live [`WorkerProcess`]. Callers
//! obtain it through [`ServiceManager::get_or_start`], which respawns
//! transparently after the previous worker was torn down. Several managers
//! may coexist, each with its own worker.

use std::sync::{Arc, Weak};
use std::time::Duration;

use log::debug;
use tokio::sync::{Mutex, watch};

use super::channel::RequestHandler;
use super::supervisor::WorkerProcess;
use crate::config::ServiceConfig;
use crate::error::{ServiceError, ServiceResult};

const LOG_TARGET: &str = "tsunagi::service::manager";

type Slot = Mutex<Option<Arc<WorkerProcess>>>;

/// Starts, hands out and stops the worker for one configuration.
pub struct ServiceManager {
    config: ServiceConfig,
    /// Held across spawn and handshake so concurrent callers share one worker.
    slot: Arc<Slot>,
    requests: Option<Arc<dyn RequestHandler>>,
}

impl ServiceManager {
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            config,
            slot: Arc::new(Mutex::new(None)),
            requests: None,
        }
    }

    /// Answer requests that workers started by this manager send back.
    pub fn with_request_handler(mut self, handler: Arc<dyn RequestHandler>) -> Self {
        self.requests = Some(handler);
        self
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Return the live worker, spawning one if there is none.
    pub async fn get_or_start(&self) -> ServiceResult<Arc<WorkerProcess>> {
        let mut slot = self.slot.lock().await;
        if let Some(process) = slot.as_ref().filter(|p| p.is_alive()) {
            return Ok(Arc::clone(process));
        }
        self.spawn_into(&mut slot).await
    }

    /// Spawn a fresh worker, stopping the current one first.
    pub async fn start(&self) -> ServiceResult<Arc<WorkerProcess>> {
        let mut slot = self.slot.lock().await;
        if let Some(previous) = slot.take() {
            previous.close(Some(ServiceError::Stopped));
        }
        self.spawn_into(&mut slot).await
    }

    async fn spawn_into(
        &self,
        slot: &mut Option<Arc<WorkerProcess>>,
    ) -> ServiceResult<Arc<WorkerProcess>> {
        // A dead handle must not be handed out again, even if the spawn fails.
        *slot = None;
        let process = Arc::new(WorkerProcess::spawn(&self.config, self.requests.clone()).await?);
        debug!(
            target: LOG_TARGET,
            "Worker started (pid {:?})",
            process.pid()
        );
        *slot = Some(Arc::clone(&process));
        self.watch(&process);
        Ok(process)
    }

    /// Clear the slot when the worker goes away, and reap it when idle.
    ///
    /// The watcher holds only weak references so that dropping the manager
    /// still drops (and thereby stops) the worker.
    fn watch(&self, process: &Arc<WorkerProcess>) {
        let token = process.close_token();
        let referenced = process.subscribe_referenced();
        let idle_timeout = self.config.idle_timeout();
        let weak_process = Arc::downgrade(process);
        let weak_slot = Arc::downgrade(&self.slot);

        tokio::spawn(async move {
            if let Some(idle_timeout) = idle_timeout {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = reap_when_idle(referenced, idle_timeout, &weak_process) => {}
                }
            } else {
                token.cancelled().await;
            }
            clear_slot(&weak_slot, &weak_process).await;
        });
    }

    /// Stop the current worker, if any. Pending calls are rejected with
    /// `Stopped`; the next call spawns a new worker.
    pub async fn stop(&self) {
        let process = self.slot.lock().await.take();
        if let Some(process) = process {
            process.close(Some(ServiceError::Stopped));
        }
    }

    /// The current worker, if one is live.
    pub async fn current(&self) -> Option<Arc<WorkerProcess>> {
        self.slot
            .lock()
            .await
            .as_ref()
            .filter(|p| p.is_alive())
            .cloned()
    }

    pub async fn is_running(&self) -> bool {
        self.current().await.is_some()
    }

    /// Resolve once the current worker has no outstanding request, or has
    /// gone away.
    pub async fn wait_idle(&self) {
        let Some(process) = self.current().await else {
            return;
        };
        let mut referenced = process.subscribe_referenced();
        let token = process.close_token();
        drop(process);

        tokio::select! {
            _ = referenced.wait_for(|r| !*r) => {}
            _ = token.cancelled() => {}
        }
    }
}

impl std::fmt::Debug for ServiceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceManager")
            .field("program", &self.config.worker.program)
            .field("answers_requests", &self.requests.is_some())
            .finish_non_exhaustive()
    }
}

/// Stop the worker once it has been un-referenced for `idle_timeout`.
async fn reap_when_idle(
    mut referenced: watch::Receiver<bool>,
    idle_timeout: Duration,
    process: &Weak<WorkerProcess>,
) {
    loop {
        if referenced.wait_for(|r| !*r).await.is_err() {
            return;
        }
        match tokio::time::timeout(idle_timeout, referenced.changed()).await {
            // Activity restarted the clock.
            Ok(Ok(())) => continue,
            Ok(Err(_)) => return,
            Err(_) => {
                let Some(process) = process.upgrade() else {
                    return;
                };
                // Refused if a request slipped in since the flag was read.
                if process.close_if_idle() {
                    debug!(
                        target: LOG_TARGET,
                        "Worker idle for {:?}, stopped",
                        idle_timeout
                    );
                    return;
                }
            }
        }
    }
}

/// Empty the slot if it still holds this worker.
async fn clear_slot(slot: &Weak<Slot>, process: &Weak<WorkerProcess>) {
    let Some(slot) = slot.upgrade() else {
        return;
    };
    let mut slot = slot.lock().await;
    let is_current = slot
        .as_ref()
        .is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), process.as_ptr()));
    if is_current {
        debug!(target: LOG_TARGET, "Worker gone, clearing slot");
        *slot = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_worker() -> ServiceConfig {
        let mut config = ServiceConfig::default();
        config.worker.program = "/nonexistent/tsunagi-worker".into();
        config
    }

    #[tokio::test]
    async fn get_or_start_reports_spawn_failure_every_time() {
        let manager = ServiceManager::new(unreachable_worker());

        for _ in 0..2 {
            let err = manager.get_or_start().await.unwrap_err();
            assert!(matches!(err, ServiceError::Spawn { .. }));
        }
        assert!(!manager.is_running().await);
    }

    #[tokio::test]
    async fn stop_without_worker_is_a_no_op() {
        let manager = ServiceManager::new(unreachable_worker());
        manager.stop().await;
        manager.stop().await;
        assert!(manager.current().await.is_none());
    }

    #[tokio::test]
    async fn wait_idle_without_worker_returns_immediately() {
        let manager = ServiceManager::new(unreachable_worker());
        tokio::time::timeout(Duration::from_secs(1), manager.wait_idle())
            .await
            .expect("wait_idle should not block without a worker");
    }

    #[tokio::test(start_paused = true)]
    async fn idle_reaper_waits_for_activity_to_stop() {
        let (tx, rx) = watch::channel(true);
        let process = Weak::new();
        let reaper = tokio::spawn(async move {
            reap_when_idle(rx, Duration::from_secs(30), &process).await;
        });

        // Still referenced after a long time: nothing happens.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(!reaper.is_finished());

        // Idle long enough: the reaper gives up on the dropped process.
        tx.send_replace(false);
        tokio::time::sleep(Duration::from_secs(31)).await;
        reaper.await.unwrap();
    }
}
