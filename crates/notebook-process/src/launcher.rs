use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use notebook_core::{ProcessHandle, ResourceConfig, ServerKey, is_safe_name};
use rand::RngCore;
use serde::Serialize;
use thiserror::Error;
use tokio::{io::AsyncWriteExt, process::Command};

use crate::console_log::{self, ConsoleLog};
use crate::{port_alloc, signal};

#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub key: ServerKey,
    pub resources: ResourceConfig,
}

/// What a successful launch hands back; the controller persists it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchedServer {
    pub process: ProcessHandle,
    pub port: u16,
    pub token: String,
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("invalid server key: {0}")]
    InvalidKey(String),

    #[error("allocate port: {0}")]
    Port(String),

    #[error("prepare working directory {path}: {source}")]
    Workdir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("server exited before becoming ready ({status})")]
    ExitedEarly { status: String },

    #[error("server did not accept connections on port {port} within {timeout_ms}ms")]
    NotReady { port: u16, timeout_ms: u128 },
}

/// Starts one server process and blocks until it is ready or has failed.
///
/// Implementations must not leave a spawned process behind when they return
/// an error or when the returned future is dropped.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedServer, LaunchError>;
}

pub const DEFAULT_COMMAND: &str = "jupyter";

pub fn default_args() -> Vec<String> {
    [
        "notebook",
        "--no-browser",
        "--ip=127.0.0.1",
        "--port={port}",
        "--NotebookApp.port_retries=0",
        "--NotebookApp.token={token}",
        "--notebook-dir={dir}",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

#[derive(Debug, Clone)]
pub struct LauncherConfig {
    pub data_root: PathBuf,
    pub command: String,
    /// Argument template. `{port}`, `{token}`, `{dir}`, `{project}` and
    /// `{owner}` are substituted per launch.
    pub args: Vec<String>,
    pub ready_timeout: Duration,
    pub log_max_bytes: u64,
    pub log_max_files: usize,
}

impl LauncherConfig {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            command: DEFAULT_COMMAND.to_string(),
            args: default_args(),
            ready_timeout: Duration::from_secs(90),
            log_max_bytes: console_log::DEFAULT_MAX_BYTES,
            log_max_files: console_log::DEFAULT_MAX_FILES,
        }
    }
}

/// `<data_root>/projects/<project>/<owner>`
pub fn server_dir(data_root: &Path, key: &ServerKey) -> Result<PathBuf, LaunchError> {
    for part in [&key.project, &key.owner] {
        if !is_safe_name(part) {
            return Err(LaunchError::InvalidKey(key.to_string()));
        }
    }
    Ok(data_root
        .join("projects")
        .join(&key.project)
        .join(&key.owner))
}

fn generate_token() -> String {
    let mut buf = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

fn render_args(template: &[String], vars: &BTreeMap<&str, String>) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            vars.iter().fold(arg.clone(), |acc, (name, value)| {
                acc.replace(&format!("{{{name}}}"), value)
            })
        })
        .collect()
}

fn join_list(v: &[String]) -> String {
    v.join(",")
}

fn resource_env(key: &ServerKey, r: &ResourceConfig) -> BTreeMap<&'static str, String> {
    BTreeMap::from([
        ("NOTEBOOK_PROJECT", key.project.clone()),
        ("NOTEBOOK_OWNER", key.owner.clone()),
        ("NOTEBOOK_DRIVER_CORES", r.driver_cores.to_string()),
        ("NOTEBOOK_DRIVER_MEMORY_MB", r.driver_memory_mb.to_string()),
        ("NOTEBOOK_NUM_EXECUTORS", r.num_executors.to_string()),
        ("NOTEBOOK_EXECUTOR_CORES", r.executor_cores.to_string()),
        ("NOTEBOOK_EXECUTOR_MEMORY_MB", r.executor_memory_mb.to_string()),
        ("NOTEBOOK_GPUS", r.gpus.to_string()),
        ("NOTEBOOK_ARCHIVES", join_list(&r.archives)),
        ("NOTEBOOK_JARS", join_list(&r.jars)),
        ("NOTEBOOK_FILES", join_list(&r.files)),
        ("NOTEBOOK_PY_FILES", join_list(&r.py_files)),
    ])
}

#[derive(Debug, Clone, Serialize)]
struct RunInfo {
    project: String,
    owner: String,
    started_at_unix_ms: u64,
    controller_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pid: Option<u32>,
    port: u16,
    exec: String,
    // The token is redacted from args.
    args: Vec<String>,
    cwd: String,
}

fn redact_token(args: &[String], token: &str) -> Vec<String> {
    args.iter()
        .map(|a| a.replace(token, "<redacted>"))
        .collect()
}

async fn write_json_atomic<T: Serialize>(dir: &Path, name: &str, value: &T) -> std::io::Result<()> {
    let path = dir.join(name);
    let tmp = dir.join(format!("{name}.tmp"));
    let data = serde_json::to_vec_pretty(value).map_err(std::io::Error::other)?;
    let mut f = tokio::fs::File::create(&tmp).await?;
    f.write_all(&data).await?;
    f.flush().await?;
    tokio::fs::rename(&tmp, &path).await
}

/// Kills the spawned process group on drop unless disarmed. This is what
/// cleans up after readiness failures and after a caller drops the launch
/// future on timeout.
struct SpawnGuard {
    pid: Option<u32>,
}

impl SpawnGuard {
    fn new(pid: u32) -> Self {
        Self { pid: Some(pid) }
    }

    fn disarm(mut self) {
        self.pid = None;
    }
}

impl Drop for SpawnGuard {
    fn drop(&mut self) {
        let Some(pid) = self.pid.take() else {
            return;
        };
        #[cfg(unix)]
        match signal::send(pid, libc::SIGKILL) {
            Ok(_) => tracing::info!(pid, "killed unready notebook server"),
            Err(err) => tracing::warn!(pid, %err, "failed to kill unready notebook server"),
        }
        #[cfg(not(unix))]
        let _ = signal::send(pid, 9);
    }
}

async fn wait_until_ready(
    child: &mut tokio::process::Child,
    port: u16,
    timeout: Duration,
) -> Result<(), LaunchError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                return Err(LaunchError::ExitedEarly {
                    status: status.to_string(),
                });
            }
            Ok(None) => {}
            Err(err) => {
                return Err(LaunchError::ExitedEarly {
                    status: format!("wait failed: {err}"),
                });
            }
        }

        if tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return Ok(());
        }

        if tokio::time::Instant::now() >= deadline {
            return Err(LaunchError::NotReady {
                port,
                timeout_ms: timeout.as_millis(),
            });
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

/// Launches notebook servers as local child processes.
#[derive(Debug, Clone)]
pub struct HostLauncher {
    config: LauncherConfig,
}

impl HostLauncher {
    pub fn new(config: LauncherConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ProcessLauncher for HostLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedServer, LaunchError> {
        let key = &spec.key;
        let dir = server_dir(&self.config.data_root, key)?;
        let workdir_err = |source| LaunchError::Workdir {
            path: dir.clone(),
            source,
        };

        tokio::fs::create_dir_all(dir.join("logs"))
            .await
            .map_err(workdir_err)?;
        write_json_atomic(&dir, "resources.json", &spec.resources)
            .await
            .map_err(workdir_err)?;

        let port = port_alloc::allocate_local_port().map_err(|e| LaunchError::Port(format!("{e:#}")))?;
        let token = generate_token();

        let vars = BTreeMap::from([
            ("port", port.to_string()),
            ("token", token.clone()),
            ("dir", dir.display().to_string()),
            ("project", key.project.clone()),
            ("owner", key.owner.clone()),
        ]);
        let args = render_args(&self.config.args, &vars);

        let log = ConsoleLog::spawn(
            dir.join("logs").join("console.log"),
            self.config.log_max_bytes,
            self.config.log_max_files,
        );

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&args)
            .current_dir(&dir)
            .envs(resource_env(key, &spec.resources))
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    // New session: the server leads its own process group and
                    // survives a controller restart.
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let started_at_unix_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let mut run = RunInfo {
            project: key.project.clone(),
            owner: key.owner.clone(),
            started_at_unix_ms,
            controller_version: env!("CARGO_PKG_VERSION").to_string(),
            pid: None,
            port,
            exec: self.config.command.clone(),
            args: redact_token(&args, &token),
            cwd: dir.display().to_string(),
        };

        log.emit(format!(
            "[notebook-control] exec: {} {} (cwd {}) port={}",
            run.exec,
            run.args.join(" "),
            run.cwd,
            port
        ));

        let mut child = cmd.spawn().map_err(|source| {
            log.emit(format!("[notebook-control] spawn failed: {source}"));
            LaunchError::Spawn {
                command: self.config.command.clone(),
                source,
            }
        })?;

        let Some(pid) = child.id() else {
            // Already exited and reaped.
            return Err(LaunchError::ExitedEarly {
                status: "exited immediately".to_string(),
            });
        };
        let guard = SpawnGuard::new(pid);

        run.pid = Some(pid);
        if let Err(err) = write_json_atomic(&dir, "run.json", &run).await {
            tracing::warn!(%err, pid, "failed to write run.json");
        }

        if let Some(out) = child.stdout.take() {
            log.attach("stdout", out);
        }
        if let Some(err) = child.stderr.take() {
            log.attach("stderr", err);
        }

        tracing::info!(project = %key.project, owner = %key.owner, pid, port, "notebook server spawned");

        if let Err(err) = wait_until_ready(&mut child, port, self.config.ready_timeout).await {
            log.emit(format!("[notebook-control] launch failed: {err}"));
            drop(guard);
            tokio::spawn(async move {
                let _ = child.wait().await;
            });
            return Err(err);
        }
        guard.disarm();

        log.emit(format!(
            "[notebook-control] port {port} is accepting connections"
        ));
        tracing::info!(project = %key.project, owner = %key.owner, pid, port, "notebook server ready");

        // Reap the child when it exits. After a controller restart nobody
        // holds this handle; the terminator then works from the pid alone.
        let exit_log = log.clone();
        let project = key.project.clone();
        let owner = key.owner.clone();
        tokio::spawn(async move {
            let res = child.wait().await;
            let status = match res {
                Ok(s) => s.to_string(),
                Err(e) => format!("wait failed: {e}"),
            };
            exit_log.emit(format!("[notebook-control] process exited: {status}"));
            tracing::info!(%project, %owner, pid, %status, "notebook server exited");
        });

        Ok(LaunchedServer {
            process: ProcessHandle::new(pid),
            port,
            token,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terminator::ProcessTerminator;

    fn resources() -> ResourceConfig {
        ResourceConfig {
            driver_cores: 2,
            driver_memory_mb: 4096,
            num_executors: 1,
            executor_cores: 1,
            executor_memory_mb: 1024,
            gpus: 0,
            archives: vec![],
            jars: vec!["a.jar".to_string(), "b.jar".to_string()],
            files: vec![],
            py_files: vec![],
        }
    }

    fn spec(owner: &str) -> LaunchSpec {
        LaunchSpec {
            key: ServerKey::new("p1", owner),
            resources: resources(),
        }
    }

    #[test]
    fn render_args_substitutes_placeholders() {
        let vars = BTreeMap::from([("port", "8888".to_string()), ("token", "t0k".to_string())]);
        let out = render_args(
            &["--port={port}".to_string(), "--token={token}".to_string(), "x".to_string()],
            &vars,
        );
        assert_eq!(out, vec!["--port=8888", "--token=t0k", "x"]);
    }

    #[test]
    fn resource_env_joins_lists() {
        let env = resource_env(&ServerKey::new("p1", "u1"), &resources());
        assert_eq!(env["NOTEBOOK_JARS"], "a.jar,b.jar");
        assert_eq!(env["NOTEBOOK_DRIVER_CORES"], "2");
        assert_eq!(env["NOTEBOOK_OWNER"], "u1");
    }

    #[test]
    fn run_info_args_hide_token() {
        let args = vec!["--NotebookApp.token=abc123".to_string()];
        assert_eq!(
            redact_token(&args, "abc123"),
            vec!["--NotebookApp.token=<redacted>"]
        );
    }

    #[test]
    fn tokens_are_unique_hex() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn server_dir_rejects_traversal() {
        let root = Path::new("/data");
        let err = server_dir(root, &ServerKey::new("p1", "../etc")).unwrap_err();
        assert!(matches!(err, LaunchError::InvalidKey(_)));
        assert_eq!(
            server_dir(root, &ServerKey::new("p1", "p1__alice")).unwrap(),
            PathBuf::from("/data/projects/p1/p1__alice")
        );
    }

    fn launcher(root: &Path, command: &str, args: &[&str], ready: Duration) -> HostLauncher {
        HostLauncher::new(LauncherConfig {
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            ready_timeout: ready,
            ..LauncherConfig::new(root)
        })
    }

    #[tokio::test]
    async fn missing_binary_is_spawn_error() {
        let root = tempfile::tempdir().unwrap();
        let l = launcher(
            root.path(),
            "/nonexistent/notebook-server",
            &[],
            Duration::from_secs(1),
        );
        let err = l.launch(&spec("u1")).await.unwrap_err();
        assert!(matches!(err, LaunchError::Spawn { .. }), "{err}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn early_exit_is_reported() {
        let root = tempfile::tempdir().unwrap();
        let l = launcher(root.path(), "sh", &["-c", "exit 3"], Duration::from_secs(5));
        let err = l.launch(&spec("u1")).await.unwrap_err();
        assert!(matches!(err, LaunchError::ExitedEarly { .. }), "{err}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unready_server_is_killed() {
        let root = tempfile::tempdir().unwrap();
        let l = launcher(root.path(), "sleep", &["30"], Duration::from_millis(300));
        let err = l.launch(&spec("u1")).await.unwrap_err();
        assert!(matches!(err, LaunchError::NotReady { .. }), "{err}");

        let dir = server_dir(root.path(), &ServerKey::new("p1", "u1")).unwrap();
        let run: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.join("run.json")).unwrap()).unwrap();
        let pid = run["pid"].as_u64().unwrap() as u32;
        assert!(signal::wait_gone(pid, Duration::from_secs(5)).await);
    }

    fn have_python3() -> bool {
        std::process::Command::new("python3")
            .arg("--version")
            .output()
            .is_ok_and(|o| o.status.success())
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn ready_servers_are_isolated_and_terminable() {
        if !have_python3() {
            eprintln!("python3 not available; skipping");
            return;
        }
        let root = tempfile::tempdir().unwrap();
        let l = launcher(
            root.path(),
            "python3",
            &["-m", "http.server", "{port}", "--bind", "127.0.0.1"],
            Duration::from_secs(20),
        );

        let (s1, s2) = (spec("u1"), spec("u2"));
        let (a, b) = tokio::join!(l.launch(&s1), l.launch(&s2));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_ne!(a.port, b.port);
        assert_ne!(a.token, b.token);
        assert_ne!(a.process, b.process);
        for (owner, server) in [("u1", &a), ("u2", &b)] {
            let dir = server_dir(root.path(), &ServerKey::new("p1", owner)).unwrap();
            let run: serde_json::Value =
                serde_json::from_slice(&std::fs::read(dir.join("run.json")).unwrap()).unwrap();
            assert_eq!(run["pid"].as_u64(), Some(u64::from(server.process.pid)));
            assert_eq!(run["port"].as_u64(), Some(u64::from(server.port)));
            assert!(dir.join("resources.json").exists());
        }

        // The spawn guard was disarmed: the servers outlive the launch call.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(signal::is_alive(a.process.pid));
        assert!(tokio::net::TcpStream::connect(("127.0.0.1", a.port)).await.is_ok());

        let t = crate::terminator::HostTerminator::new(crate::terminator::TerminatorConfig {
            graceful_timeout: Duration::from_secs(2),
            kill_grace: Duration::from_secs(1),
        })
        .unwrap();
        let record = notebook_core::ServerRecord {
            project: "p1".to_string(),
            owner: "u1".to_string(),
            port: a.port,
            token: a.token.clone(),
            process: a.process,
            resources: resources(),
            created_at: chrono::Utc::now(),
        };
        // A plain file server has no shutdown endpoint.
        assert!(t.graceful(&record).await.is_err());

        for server in [&a, &b] {
            let out = t.forceful(&server.process).await.unwrap();
            assert_eq!(out, crate::terminator::ForcefulOutcome::Killed);
            assert!(signal::wait_gone(server.process.pid, Duration::from_secs(5)).await);
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dropped_launch_future_kills_process() {
        let root = tempfile::tempdir().unwrap();
        let l = launcher(root.path(), "sleep", &["30"], Duration::from_secs(30));
        let res = tokio::time::timeout(Duration::from_millis(500), l.launch(&spec("u2"))).await;
        assert!(res.is_err());

        let dir = server_dir(root.path(), &ServerKey::new("p1", "u2")).unwrap();
        let run: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.join("run.json")).unwrap()).unwrap();
        let pid = run["pid"].as_u64().unwrap() as u32;
        assert!(signal::wait_gone(pid, Duration::from_secs(5)).await);
    }
}
