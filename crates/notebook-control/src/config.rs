use std::{collections::BTreeSet, net::SocketAddr, path::PathBuf, time::Duration};

use notebook_process::{LauncherConfig, TerminatorConfig, launcher};

use crate::controller::ControllerConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreKind {
    Database(String),
    /// Records live in this process only. Dev and tests.
    Memory,
}

#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub listen_addr: SocketAddr,
    pub store: StoreKind,
    pub launcher: LauncherConfig,
    pub terminator: TerminatorConfig,
    pub controller: ControllerConfig,
    pub allowed_users: Option<BTreeSet<String>>,
}

fn clamped_ms(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default_ms: u64,
    min_ms: u64,
    max_ms: u64,
) -> Duration {
    Duration::from_millis(
        lookup(name)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(|v| v.clamp(min_ms, max_ms))
            .unwrap_or(default_ms),
    )
}

impl ControlConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let listen_addr: SocketAddr = match non_empty("NOTEBOOK_LISTEN_ADDR") {
            Some(v) => v
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid NOTEBOOK_LISTEN_ADDR {v:?}: {e}"))?,
            None => ([0, 0, 0, 0], 8080).into(),
        };

        let store = match non_empty("NOTEBOOK_STORE")
            .map(|v| v.trim().to_ascii_lowercase())
            .as_deref()
        {
            Some("memory") => StoreKind::Memory,
            None | Some("db") | Some("database") => {
                let url = non_empty("DATABASE_URL").ok_or_else(|| {
                    anyhow::anyhow!("DATABASE_URL is required (or set NOTEBOOK_STORE=memory)")
                })?;
                StoreKind::Database(url)
            }
            Some(other) => anyhow::bail!("unknown NOTEBOOK_STORE: {other}"),
        };

        let mut launcher = LauncherConfig::new(
            non_empty("NOTEBOOK_DATA_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
        );
        if let Some(cmd) = non_empty("NOTEBOOK_SERVER_COMMAND") {
            launcher.command = cmd.trim().to_string();
        }
        launcher.args = match non_empty("NOTEBOOK_SERVER_ARGS") {
            Some(v) => v.split_whitespace().map(String::from).collect(),
            None => launcher::default_args(),
        };
        launcher.ready_timeout =
            clamped_ms(&lookup, "NOTEBOOK_READY_TIMEOUT_MS", 90_000, 500, 10 * 60 * 1000);

        let terminator = TerminatorConfig {
            graceful_timeout: clamped_ms(&lookup, "NOTEBOOK_GRACEFUL_TIMEOUT_MS", 5_000, 100, 60_000),
            kill_grace: clamped_ms(&lookup, "NOTEBOOK_KILL_GRACE_MS", 3_000, 100, 60_000),
        };

        let controller = ControllerConfig {
            launch_timeout: clamped_ms(
                &lookup,
                "NOTEBOOK_LAUNCH_TIMEOUT_MS",
                120_000,
                1_000,
                10 * 60 * 1000,
            ),
        };

        let allowed_users = non_empty("NOTEBOOK_ALLOWED_USERS").map(|v| {
            v.split(',')
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect::<BTreeSet<_>>()
        });

        Ok(Self {
            listen_addr,
            store,
            launcher,
            terminator,
            controller,
            allowed_users,
        })
    }
}
