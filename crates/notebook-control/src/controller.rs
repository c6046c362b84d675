use std::{sync::Arc, time::Duration};

use chrono::Utc;
use notebook_core::{
    ProcessHandle, ResourceRequest, ServerKey, ServerRecord, ServerStatus, StopOutcome,
    is_safe_name,
};
use notebook_process::{ForcefulOutcome, LaunchSpec, ProcessLauncher, ProcessTerminator};

use crate::{
    cache::CachedStore,
    error::ControlError,
    locks::KeyedLocks,
    store::{InsertOutcome, ServerStore},
};

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Upper bound on one launch, readiness included.
    pub launch_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            launch_timeout: Duration::from_secs(120),
        }
    }
}

/// Keeps at most one notebook server per (project, owner) and reconciles the
/// stored record with the process it describes.
///
/// Start and Stop for one key are serialized; reads never wait on them.
pub struct LifecycleController {
    store: CachedStore,
    launcher: Arc<dyn ProcessLauncher>,
    terminator: Arc<dyn ProcessTerminator>,
    locks: KeyedLocks<ServerKey>,
    config: ControllerConfig,
}

impl LifecycleController {
    pub fn new(
        store: Arc<dyn ServerStore>,
        launcher: Arc<dyn ProcessLauncher>,
        terminator: Arc<dyn ProcessTerminator>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            store: CachedStore::new(store),
            launcher,
            terminator,
            locks: KeyedLocks::new(),
            config,
        }
    }

    /// The record for `key`, possibly stale while a stop is in flight.
    pub async fn query(&self, key: &ServerKey) -> Result<ServerRecord, ControlError> {
        self.store
            .get_cached(key)
            .await?
            .ok_or_else(|| ControlError::NotFound(key.clone()))
    }

    pub async fn status(&self, key: &ServerKey) -> Result<ServerStatus, ControlError> {
        let record = self.query(key).await?;
        let alive = self.terminator.is_alive(&record.process);
        Ok(ServerStatus { record, alive })
    }

    pub async fn list(&self, project: &str) -> Result<Vec<ServerRecord>, ControlError> {
        Ok(self.store.list_project(project).await?)
    }

    /// Returns the running server for `key`, launching one if none is recorded.
    ///
    /// When a record already exists the request is ignored and the record is
    /// returned unchanged.
    pub async fn start(
        &self,
        key: &ServerKey,
        request: &ResourceRequest,
    ) -> Result<ServerRecord, ControlError> {
        validate_key(key)?;
        let resources = request
            .validate()
            .map_err(|field_errors| ControlError::InvalidRequest {
                message: "invalid resource request".to_string(),
                field_errors,
            })?;

        let _guard = self.locks.acquire(key).await;

        if let Some(existing) = self.store.get(key).await? {
            tracing::debug!(
                project = %key.project,
                owner = %key.owner,
                pid = existing.process.pid,
                "notebook server already recorded"
            );
            return Ok(existing);
        }

        let spec = LaunchSpec {
            key: key.clone(),
            resources: resources.clone(),
        };
        let launched =
            match tokio::time::timeout(self.config.launch_timeout, self.launcher.launch(&spec))
                .await
            {
                Ok(Ok(launched)) => launched,
                Ok(Err(err)) => {
                    tracing::warn!(project = %key.project, owner = %key.owner, error = %err, "launch failed");
                    return Err(ControlError::LaunchFailed(err.to_string()));
                }
                Err(_) => {
                    let ms = self.config.launch_timeout.as_millis();
                    tracing::warn!(project = %key.project, owner = %key.owner, timeout_ms = ms, "launch timed out");
                    return Err(ControlError::LaunchFailed(format!(
                        "launch did not finish within {ms}ms"
                    )));
                }
            };

        let record = ServerRecord {
            project: key.project.clone(),
            owner: key.owner.clone(),
            port: launched.port,
            token: launched.token,
            process: launched.process,
            resources,
            created_at: Utc::now(),
        };

        match self.store.insert_if_absent(&record).await {
            Ok(InsertOutcome::Inserted) => {
                tracing::info!(
                    project = %key.project,
                    owner = %key.owner,
                    pid = record.process.pid,
                    port = record.port,
                    "notebook server started"
                );
                Ok(record)
            }
            Ok(InsertOutcome::Existing(winner)) => {
                tracing::warn!(
                    project = %key.project,
                    owner = %key.owner,
                    pid = record.process.pid,
                    winner_pid = winner.process.pid,
                    "another controller recorded a server first; discarding ours"
                );
                self.discard(key, &record.process).await;
                Ok(winner)
            }
            Err(err) => {
                tracing::error!(
                    project = %key.project,
                    owner = %key.owner,
                    pid = record.process.pid,
                    error = %err,
                    "failed to persist server record; discarding launched server"
                );
                self.discard(key, &record.process).await;
                Err(err.into())
            }
        }
    }

    /// Shuts down the server for `key` and forgets it.
    ///
    /// Once a record is found the record is always deleted; a process that
    /// could not be confirmed dead yields [`StopOutcome::Degraded`].
    pub async fn stop(&self, key: &ServerKey) -> Result<StopOutcome, ControlError> {
        let _guard = self.locks.acquire(key).await;

        let record = self
            .store
            .get(key)
            .await?
            .ok_or_else(|| ControlError::NotFound(key.clone()))?;
        let pid = record.process.pid;

        let outcome = match self.terminator.graceful(&record).await {
            Ok(()) => StopOutcome::Graceful,
            Err(err) => {
                tracing::warn!(
                    project = %key.project,
                    owner = %key.owner,
                    pid,
                    error = %err,
                    "graceful shutdown failed; falling back to signals"
                );
                match self.terminator.forceful(&record.process).await {
                    Ok(ForcefulOutcome::Killed) | Ok(ForcefulOutcome::AlreadyGone) => {
                        StopOutcome::Forced
                    }
                    Err(err) => {
                        tracing::warn!(
                            project = %key.project,
                            owner = %key.owner,
                            pid,
                            error = %err,
                            "termination degraded; process may still be running"
                        );
                        StopOutcome::Degraded
                    }
                }
            }
        };

        if !self.store.delete(key).await? {
            tracing::debug!(project = %key.project, owner = %key.owner, "record already gone");
        }
        tracing::info!(project = %key.project, owner = %key.owner, pid, ?outcome, "notebook server stopped");
        Ok(outcome)
    }

    async fn discard(&self, key: &ServerKey, process: &ProcessHandle) {
        match self.terminator.forceful(process).await {
            Ok(outcome) => {
                tracing::info!(project = %key.project, owner = %key.owner, pid = process.pid, ?outcome, "discarded launched server");
            }
            Err(err) => {
                tracing::error!(project = %key.project, owner = %key.owner, pid = process.pid, error = %err, "failed to discard launched server");
            }
        }
    }
}

fn validate_key(key: &ServerKey) -> Result<(), ControlError> {
    let mut field_errors = notebook_core::FieldErrors::new();
    if !is_safe_name(&key.project) {
        field_errors.insert("project".to_string(), "invalid name".to_string());
    }
    if !is_safe_name(&key.owner) {
        field_errors.insert("owner".to_string(), "invalid name".to_string());
    }
    if field_errors.is_empty() {
        Ok(())
    } else {
        Err(ControlError::InvalidRequest {
            message: format!("invalid server key {key}"),
            field_errors,
        })
    }
}
