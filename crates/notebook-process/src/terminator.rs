use std::time::Duration;

use async_trait::async_trait;
use notebook_core::{ProcessHandle, ServerRecord};
use thiserror::Error;

use crate::signal::{self, Delivery};

#[derive(Debug, Error)]
pub enum TerminateError {
    #[error("shutdown request to port {port} failed: {source}")]
    Request {
        port: u16,
        #[source]
        source: reqwest::Error,
    },

    #[error("shutdown request rejected with HTTP {status}")]
    Rejected { status: u16 },

    #[error("process {pid} still alive after {waited_ms}ms")]
    StillAlive { pid: u32, waited_ms: u128 },

    #[error("signal process {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForcefulOutcome {
    Killed,
    /// Nothing to signal; the process exited on its own at some point.
    AlreadyGone,
}

#[async_trait]
pub trait ProcessTerminator: Send + Sync {
    /// Asks the server to shut itself down and waits for the process to go away.
    async fn graceful(&self, record: &ServerRecord) -> Result<(), TerminateError>;

    /// Signals the process by its persisted handle. "No such process" is success.
    async fn forceful(&self, process: &ProcessHandle) -> Result<ForcefulOutcome, TerminateError>;

    fn is_alive(&self, process: &ProcessHandle) -> bool;
}

#[derive(Debug, Clone, Copy)]
pub struct TerminatorConfig {
    /// Bounds the shutdown request plus the wait for the process to exit.
    pub graceful_timeout: Duration,
    /// Wait between SIGTERM and SIGKILL, and after SIGKILL.
    pub kill_grace: Duration,
}

impl Default for TerminatorConfig {
    fn default() -> Self {
        Self {
            graceful_timeout: Duration::from_secs(5),
            kill_grace: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HostTerminator {
    http: reqwest::Client,
    config: TerminatorConfig,
}

impl HostTerminator {
    /// Fails only if the HTTP client cannot be built; a client without the
    /// request timeout could hold a stop open indefinitely.
    pub fn new(config: TerminatorConfig) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(config.graceful_timeout)
            .no_proxy()
            .build()?;
        Ok(Self { http, config })
    }
}

#[async_trait]
impl ProcessTerminator for HostTerminator {
    async fn graceful(&self, record: &ServerRecord) -> Result<(), TerminateError> {
        let started = tokio::time::Instant::now();
        let url = format!("http://127.0.0.1:{}/api/shutdown", record.port);
        let resp = self
            .http
            .post(&url)
            .header("Authorization", format!("token {}", record.token))
            .send()
            .await
            .map_err(|source| TerminateError::Request {
                port: record.port,
                source,
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(TerminateError::Rejected {
                status: status.as_u16(),
            });
        }

        let remaining = self
            .config
            .graceful_timeout
            .saturating_sub(started.elapsed());
        let pid = record.process.pid;
        if signal::wait_gone(pid, remaining).await {
            Ok(())
        } else {
            Err(TerminateError::StillAlive {
                pid,
                waited_ms: started.elapsed().as_millis(),
            })
        }
    }

    #[cfg(unix)]
    async fn forceful(&self, process: &ProcessHandle) -> Result<ForcefulOutcome, TerminateError> {
        let pid = process.pid;
        let send = |sig| {
            signal::send(pid, sig).map_err(|source| TerminateError::Signal { pid, source })
        };

        if send(libc::SIGTERM)? == Delivery::NoSuchProcess {
            return Ok(ForcefulOutcome::AlreadyGone);
        }
        if signal::wait_gone(pid, self.config.kill_grace).await {
            return Ok(ForcefulOutcome::Killed);
        }

        tracing::warn!(pid, "process ignored SIGTERM; sending SIGKILL");
        if send(libc::SIGKILL)? == Delivery::NoSuchProcess
            || signal::wait_gone(pid, self.config.kill_grace).await
        {
            return Ok(ForcefulOutcome::Killed);
        }

        Err(TerminateError::StillAlive {
            pid,
            waited_ms: self.config.kill_grace.saturating_mul(2).as_millis(),
        })
    }

    #[cfg(not(unix))]
    async fn forceful(&self, process: &ProcessHandle) -> Result<ForcefulOutcome, TerminateError> {
        signal::send(process.pid, 9)
            .map(|_| ForcefulOutcome::Killed)
            .map_err(|source| TerminateError::Signal {
                pid: process.pid,
                source,
            })
    }

    fn is_alive(&self, process: &ProcessHandle) -> bool {
        signal::is_alive(process.pid)
    }
}
