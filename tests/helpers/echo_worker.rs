//! Configuration and polling helpers for tests against `tsunagi-echo-worker`.

#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use tsunagi::ServiceConfig;

/// Path of the echo worker built alongside the tests.
pub fn echo_worker_path() -> &'static str {
    // Set by Cargo's test harness for integration tests.
    env!("CARGO_BIN_EXE_tsunagi-echo-worker")
}

/// Defaults pointing at the echo worker.
pub fn echo_worker_config() -> ServiceConfig {
    let mut config = ServiceConfig::for_program(echo_worker_path());
    config.handshake_timeout_ms = 5_000;
    config
}

/// Poll `condition` every 10ms until it holds, failing after `limit`.
pub async fn eventually<F, Fut>(limit: Duration, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    while !condition().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {limit:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
