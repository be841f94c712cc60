//! Named operations over the managed worker.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::manager::ServiceManager;
use super::supervisor::WorkerProcess;
use crate::config::ServiceConfig;
use crate::error::{ServiceError, ServiceResult};
use crate::protocol::Value;

/// Entry point for callers.
///
/// Each operation obtains the live worker (spawning it on first use or after
/// a crash) and forwards one request. Results and errors are passed through
/// unchanged. Cloning is cheap and clones share the worker.
#[derive(Debug, Clone)]
pub struct Service {
    manager: Arc<ServiceManager>,
}

impl Service {
    pub fn new(config: ServiceConfig) -> Self {
        Self::with_manager(Arc::new(ServiceManager::new(config)))
    }

    pub fn with_manager(manager: Arc<ServiceManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<ServiceManager> {
        &self.manager
    }

    /// Send `command` with `args` and wait for the worker's answer.
    pub async fn call(&self, command: &str, args: Value) -> ServiceResult<Value> {
        let process = self.manager.get_or_start().await?;
        process.call(command, args).await
    }

    /// Like [`call`](Self::call), but stop waiting after `timeout`.
    ///
    /// `None` falls back to the configured `call_timeout_ms`, and to no
    /// timeout at all if that is unset. On expiry the request is not
    /// withdrawn: it stays pending until the worker answers or goes away.
    pub async fn call_with_timeout(
        &self,
        command: &str,
        args: Value,
        timeout: Option<Duration>,
    ) -> ServiceResult<Value> {
        let Some(after) = timeout.or_else(|| self.manager.config().call_timeout()) else {
            return self.call(command, args).await;
        };
        let process = self.manager.get_or_start().await?;
        tokio::time::timeout(after, process.call(command, args))
            .await
            .map_err(|_| ServiceError::Timeout {
                command: command.to_string(),
                after,
            })?
    }

    /// Typed wrapper around [`call`](Self::call).
    pub async fn call_as<P, R>(&self, command: &str, params: &P) -> ServiceResult<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let args = Value::from_serialize(params)?;
        let result = self.call(command, args).await?;
        Ok(result.into_deserialize()?)
    }

    /// Run a build with the given options.
    pub async fn build(&self, options: Value) -> ServiceResult<Value> {
        self.call("build", options).await
    }

    /// Transform one input with the given options.
    pub async fn transform(&self, input: &str, options: Value) -> ServiceResult<Value> {
        let args = Value::object([("input", Value::from(input)), ("options", options)]);
        self.call("transform", args).await
    }

    /// Run one request in a worker started just for it, leaving the managed
    /// worker alone.
    pub async fn run_once(&self, command: &str, args: Value) -> ServiceResult<Value> {
        WorkerProcess::run_once(self.manager.config(), command, args).await
    }

    /// Stop the worker; the next operation starts a new one.
    pub async fn stop(&self) {
        self.manager.stop().await;
    }

    pub async fn is_running(&self) -> bool {
        self.manager.is_running().await
    }

    /// Resolve once no request is outstanding.
    pub async fn wait_idle(&self) {
        self.manager.wait_idle().await;
    }
}
