//! In-process fakes for the launcher, terminator and store seams.

use std::{
    collections::HashSet,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use notebook_core::{ProcessHandle, ResourceConfig, ResourceRequest, ServerKey, ServerRecord};
use notebook_process::{
    ForcefulOutcome, LaunchError, LaunchSpec, LaunchedServer, ProcessLauncher, ProcessTerminator,
    TerminateError,
};
use sea_orm::DbErr;
use tokio::sync::{Barrier, oneshot};

use crate::store::{InsertOutcome, MemoryStore, ServerStore, StoreError};

pub fn resources() -> ResourceConfig {
    ResourceConfig {
        driver_cores: 1,
        driver_memory_mb: 2048,
        num_executors: 2,
        executor_cores: 2,
        executor_memory_mb: 4096,
        gpus: 0,
        archives: vec![],
        jars: vec![],
        files: vec![],
        py_files: vec![],
    }
}

pub fn sample_request() -> ResourceRequest {
    resources().into()
}

pub fn record(project: &str, owner: &str, port: u16, pid: u32) -> ServerRecord {
    ServerRecord {
        project: project.to_string(),
        owner: owner.to_string(),
        port,
        token: format!("tok-{pid}"),
        process: ProcessHandle::new(pid),
        resources: resources(),
        created_at: chrono::Utc::now(),
    }
}

/// Sets its flag when dropped; lets tests observe a cancelled launch future.
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeLauncher {
    pub launches: AtomicUsize,
    next_pid: AtomicU32,
    delay: Option<Duration>,
    fail: bool,
    barrier: Option<Arc<Barrier>>,
    pub cancelled: Arc<AtomicBool>,
    pub finished: AtomicUsize,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(1000),
            ..Default::default()
        }
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::new()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    /// Every launch waits at the barrier, so `n` launches only complete if
    /// all `n` are in flight at once.
    pub fn with_barrier(n: usize) -> Self {
        Self {
            barrier: Some(Arc::new(Barrier::new(n))),
            ..Self::new()
        }
    }

    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessLauncher for FakeLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedServer, LaunchError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let flag = DropFlag(self.cancelled.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(barrier) = &self.barrier {
            barrier.wait().await;
        }
        // Ran to completion: not a cancellation.
        std::mem::forget(flag);

        if self.fail {
            return Err(LaunchError::ExitedEarly {
                status: format!("exit status: 1 ({})", spec.key),
            });
        }
        self.finished.fetch_add(1, Ordering::SeqCst);
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        Ok(LaunchedServer {
            process: ProcessHandle::new(pid),
            port: 40_000 + (pid % 10_000) as u16,
            token: format!("tok-{pid}"),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForcefulMode {
    Killed,
    AlreadyGone,
    Fail,
}

pub struct FakeTerminator {
    graceful_ok: AtomicBool,
    forceful_mode: Mutex<ForcefulMode>,
    pub graceful_calls: Mutex<Vec<ServerKey>>,
    pub forceful_calls: Mutex<Vec<u32>>,
    alive: Mutex<HashSet<u32>>,
}

impl FakeTerminator {
    pub fn new() -> Self {
        Self {
            graceful_ok: AtomicBool::new(true),
            forceful_mode: Mutex::new(ForcefulMode::Killed),
            graceful_calls: Mutex::new(Vec::new()),
            forceful_calls: Mutex::new(Vec::new()),
            alive: Mutex::new(HashSet::new()),
        }
    }

    pub fn set_graceful_ok(&self, ok: bool) {
        self.graceful_ok.store(ok, Ordering::SeqCst);
    }

    pub fn set_forceful(&self, mode: ForcefulMode) {
        *self.forceful_mode.lock().unwrap() = mode;
    }

    pub fn set_alive(&self, pid: u32) {
        self.alive.lock().unwrap().insert(pid);
    }

    pub fn graceful_count(&self) -> usize {
        self.graceful_calls.lock().unwrap().len()
    }

    pub fn forceful_pids(&self) -> Vec<u32> {
        self.forceful_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProcessTerminator for FakeTerminator {
    async fn graceful(&self, record: &ServerRecord) -> Result<(), TerminateError> {
        self.graceful_calls.lock().unwrap().push(record.key());
        if self.graceful_ok.load(Ordering::SeqCst) {
            self.alive.lock().unwrap().remove(&record.process.pid);
            Ok(())
        } else {
            Err(TerminateError::Rejected { status: 403 })
        }
    }

    async fn forceful(&self, process: &ProcessHandle) -> Result<ForcefulOutcome, TerminateError> {
        self.forceful_calls.lock().unwrap().push(process.pid);
        let mode = *self.forceful_mode.lock().unwrap();
        match mode {
            ForcefulMode::Killed => {
                self.alive.lock().unwrap().remove(&process.pid);
                Ok(ForcefulOutcome::Killed)
            }
            ForcefulMode::AlreadyGone => Ok(ForcefulOutcome::AlreadyGone),
            ForcefulMode::Fail => Err(TerminateError::StillAlive {
                pid: process.pid,
                waited_ms: 0,
            }),
        }
    }

    fn is_alive(&self, process: &ProcessHandle) -> bool {
        self.alive.lock().unwrap().contains(&process.pid)
    }
}

/// Wraps a [`MemoryStore`] and fails selected operations.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    pub fail_insert: AtomicBool,
    pub fail_delete: AtomicBool,
    /// Record a concurrent controller "wins" with right before our insert.
    pub preempt: Mutex<Option<ServerRecord>>,
}

fn unavailable() -> StoreError {
    StoreError::Db(DbErr::Custom("connection refused".to_string()))
}

#[async_trait]
impl ServerStore for FlakyStore {
    async fn get(&self, key: &ServerKey) -> Result<Option<ServerRecord>, StoreError> {
        self.inner.get(key).await
    }

    async fn list_project(&self, project: &str) -> Result<Vec<ServerRecord>, StoreError> {
        self.inner.list_project(project).await
    }

    async fn insert_if_absent(&self, record: &ServerRecord) -> Result<InsertOutcome, StoreError> {
        if self.fail_insert.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        let preempt = self.preempt.lock().unwrap().take();
        if let Some(winner) = preempt {
            self.inner.insert_if_absent(&winner).await?;
        }
        self.inner.insert_if_absent(record).await
    }

    async fn delete(&self, key: &ServerKey) -> Result<bool, StoreError> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        self.inner.delete(key).await
    }
}

type Gate = (oneshot::Sender<()>, oneshot::Receiver<()>);

/// Wraps a [`MemoryStore`]; an armed `get` reads, then parks until released.
#[derive(Default)]
pub struct PausingStore {
    pub inner: MemoryStore,
    gate: Mutex<Option<Gate>>,
}

impl PausingStore {
    /// Arms the next `get`. Returns a receiver that fires once that `get` has
    /// read the store, and the sender that lets it return.
    pub fn pause_next_get(&self) -> (oneshot::Receiver<()>, oneshot::Sender<()>) {
        let (reached_tx, reached_rx) = oneshot::channel();
        let (resume_tx, resume_rx) = oneshot::channel();
        *self.gate.lock().unwrap() = Some((reached_tx, resume_rx));
        (reached_rx, resume_tx)
    }
}

#[async_trait]
impl ServerStore for PausingStore {
    async fn get(&self, key: &ServerKey) -> Result<Option<ServerRecord>, StoreError> {
        let found = self.inner.get(key).await?;
        let gate = self.gate.lock().unwrap().take();
        if let Some((reached, resume)) = gate {
            let _ = reached.send(());
            let _ = resume.await;
        }
        Ok(found)
    }

    async fn list_project(&self, project: &str) -> Result<Vec<ServerRecord>, StoreError> {
        self.inner.list_project(project).await
    }

    async fn insert_if_absent(&self, record: &ServerRecord) -> Result<InsertOutcome, StoreError> {
        self.inner.insert_if_absent(record).await
    }

    async fn delete(&self, key: &ServerKey) -> Result<bool, StoreError> {
        self.inner.delete(key).await
    }
}
