use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};

/// Identifies the single notebook server slot of one system user in one project.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct ServerKey {
    pub project: String,
    pub owner: String,
}

impl ServerKey {
    pub fn new(project: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            owner: owner.into(),
        }
    }
}

impl fmt::Display for ServerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project, self.owner)
    }
}

/// Serialized OS process reference. Survives controller restarts; termination
/// works from this value alone.
///
/// Launched servers lead their own session, so `pid` is also the process group id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ProcessHandle {
    pub pid: u32,
}

impl ProcessHandle {
    pub fn new(pid: u32) -> Self {
        Self { pid }
    }
}

/// Validated resource snapshot used to launch a server. Never mutated after
/// the record is created.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ResourceConfig {
    pub driver_cores: u32,
    pub driver_memory_mb: u32,
    pub num_executors: u32,
    pub executor_cores: u32,
    pub executor_memory_mb: u32,
    pub gpus: u32,
    #[serde(default)]
    pub archives: Vec<String>,
    #[serde(default)]
    pub jars: Vec<String>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub py_files: Vec<String>,
}

/// Wire shape of a start request. Everything is optional here so that missing
/// fields can be reported per field instead of as a decode failure.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ResourceRequest {
    pub driver_cores: Option<u32>,
    pub driver_memory_mb: Option<u32>,
    pub num_executors: Option<u32>,
    pub executor_cores: Option<u32>,
    pub executor_memory_mb: Option<u32>,
    pub gpus: Option<u32>,
    #[serde(default)]
    pub archives: Vec<String>,
    #[serde(default)]
    pub jars: Vec<String>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub py_files: Vec<String>,
}

pub type FieldErrors = BTreeMap<String, String>;

fn required(
    errors: &mut FieldErrors,
    field: &str,
    value: Option<u32>,
    min: u32,
) -> u32 {
    match value {
        None => {
            errors.insert(field.to_string(), "required".to_string());
            0
        }
        Some(v) if v < min => {
            errors.insert(field.to_string(), format!("must be at least {min}"));
            v
        }
        Some(v) => v,
    }
}

fn file_list(errors: &mut FieldErrors, field: &str, entries: &[String]) -> Vec<String> {
    for (i, entry) in entries.iter().enumerate() {
        if entry.trim().is_empty() {
            errors.insert(format!("{field}[{i}]"), "must be non-empty".to_string());
        } else if entry.chars().any(char::is_control) {
            errors.insert(
                format!("{field}[{i}]"),
                "must not contain control characters".to_string(),
            );
        }
    }
    entries.iter().map(|e| e.trim().to_string()).collect()
}

impl ResourceRequest {
    /// Checks presence and shape only; the values are passed through to the
    /// launched server untouched.
    pub fn validate(&self) -> Result<ResourceConfig, FieldErrors> {
        let mut errors = FieldErrors::new();

        let cfg = ResourceConfig {
            driver_cores: required(&mut errors, "driver_cores", self.driver_cores, 1),
            driver_memory_mb: required(&mut errors, "driver_memory_mb", self.driver_memory_mb, 1),
            num_executors: required(&mut errors, "num_executors", self.num_executors, 0),
            executor_cores: required(&mut errors, "executor_cores", self.executor_cores, 1),
            executor_memory_mb: required(
                &mut errors,
                "executor_memory_mb",
                self.executor_memory_mb,
                1,
            ),
            gpus: required(&mut errors, "gpus", self.gpus, 0),
            archives: file_list(&mut errors, "archives", &self.archives),
            jars: file_list(&mut errors, "jars", &self.jars),
            files: file_list(&mut errors, "files", &self.files),
            py_files: file_list(&mut errors, "py_files", &self.py_files),
        };

        if errors.is_empty() {
            Ok(cfg)
        } else {
            Err(errors)
        }
    }
}

impl From<ResourceConfig> for ResourceRequest {
    fn from(c: ResourceConfig) -> Self {
        Self {
            driver_cores: Some(c.driver_cores),
            driver_memory_mb: Some(c.driver_memory_mb),
            num_executors: Some(c.num_executors),
            executor_cores: Some(c.executor_cores),
            executor_memory_mb: Some(c.executor_memory_mb),
            gpus: Some(c.gpus),
            archives: c.archives,
            jars: c.jars,
            files: c.files,
            py_files: c.py_files,
        }
    }
}

/// Durable descriptor of a launched notebook server.
///
/// A record means "a server was launched", not "the process is alive".
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ServerRecord {
    pub project: String,
    pub owner: String,
    pub port: u16,
    pub token: String,
    pub process: ProcessHandle,
    pub resources: ResourceConfig,
    pub created_at: DateTime<Utc>,
}

impl ServerRecord {
    pub fn key(&self) -> ServerKey {
        ServerKey::new(self.project.clone(), self.owner.clone())
    }
}

/// Record plus a point-in-time liveness probe of its process.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ServerStatus {
    #[serde(flatten)]
    pub record: ServerRecord,
    pub alive: bool,
}

/// How a stop request ended. All variants leave no record behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    /// The server shut itself down on request.
    Graceful,
    /// Graceful shutdown failed; the process was signalled (or was already gone).
    Forced,
    /// Neither path could confirm the process is gone. The record was dropped anyway.
    Degraded,
}

/// Path- and argv-safe identifier check used for project and owner names.
pub fn is_safe_name(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 128
        && s != "."
        && s != ".."
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}
