//! Generation engine
//!
//! Turns a request into something ACE-Step can run (a TOML config for
//! `cli.py`, or a JSON payload for the API server) and runs queued jobs.

pub mod ace_config;
pub mod api_runner;
pub mod api_server;
pub mod executor;
pub mod payload;
pub mod process;
pub mod runner;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::types::job::QueueJob;

/// Cooperative stop signal shared between a runner and whoever cancels it
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolves once [`stop`](Self::stop) has been called.
    pub async fn stopped(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_stopped() {
                return;
            }
            notified.await;
        }
    }
}

/// Result of running one job
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobOutcome {
    pub code: i32,
    /// Files saved by the API workflow with the seed each was generated
    /// with; empty for CLI runs, whose outputs are found by snapshot.
    pub outputs: Vec<(PathBuf, Option<u64>)>,
}

impl JobOutcome {
    pub fn code(code: i32) -> Self {
        Self {
            code,
            outputs: Vec::new(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.code == 0
    }
}

/// Runs queued jobs for the queue worker
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Whether `job` can start now. API jobs wait for the server.
    async fn ready(&self, job: &QueueJob) -> bool;

    /// Run `job` to completion or until `stop` fires.
    async fn run(&self, job: &QueueJob, stop: StopHandle) -> JobOutcome;

    /// Release long-lived resources such as the API server.
    async fn shutdown(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_stop_handle_wakes_waiter() {
        let stop = StopHandle::new();
        let waiter = {
            let stop = stop.clone();
            tokio::spawn(async move { stop.stopped().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        stop.stop();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(stop.is_stopped());
    }

    #[tokio::test]
    async fn test_stopped_returns_immediately_after_stop() {
        let stop = StopHandle::new();
        stop.stop();
        tokio::time::timeout(Duration::from_millis(100), stop.stopped())
            .await
            .unwrap();
    }
}
