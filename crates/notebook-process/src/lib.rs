//! Host-side process plumbing for notebook servers: spawning with a readiness
//! probe, graceful and forceful termination, and console log capture.

pub mod console_log;
pub mod launcher;
pub mod port_alloc;
pub mod signal;
pub mod terminator;

pub use launcher::{
    HostLauncher, LaunchError, LaunchSpec, LaunchedServer, LauncherConfig, ProcessLauncher,
};
pub use terminator::{
    ForcefulOutcome, HostTerminator, ProcessTerminator, TerminateError, TerminatorConfig,
};
