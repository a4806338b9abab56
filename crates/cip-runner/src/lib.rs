//! Orchestration of one server/client test run: staging on each role's agent,
//! readiness gating, output multiplexing and bundle sealing.

mod controller;
mod error;
mod local;
mod mux;
mod options;
mod phase;
mod process;
mod readiness;
mod ssh;
mod transport;

pub use controller::{Controller, RunResult, RunStatus, CLIENT_BACKSTOP_SLACK};
pub use error::{
    ControllerError, ReadinessError, RunError, RunErrorKind, TransportError, TransportErrorKind,
};
pub use local::LocalTransport;
pub use mux::{
    merge, parse_stats_line, Multiplexer, MuxEvent, OutputEvent, RoleCapture, RoleStats,
    RunOutput, StatsSnapshot, StreamKind,
};
pub use options::{
    ControllerOptions, DEFAULT_BUNDLE_DIR, DEFAULT_ROLE_BIN, DEFAULT_SCP_PROGRAM,
    DEFAULT_SSH_PROGRAM, ENV_BUNDLE_DIR, ENV_CONNECT_TIMEOUT_SECS, ENV_ROLE_BIN, ENV_SCP, ENV_SSH,
    ENV_STATS_INTERVAL_MS, ENV_STOP_GRACE_MS,
};
pub use phase::{Phase, PhaseObserver, PhaseUpdate};
pub use process::{ExitResult, Termination};
pub use readiness::{strategy_for, wait_ready, Immediate, MarkerLine, ReadinessStrategy};
pub use ssh::{remote_workdir, SshConfig, SshTransport};
pub use transport::{
    DefaultTransportFactory, RoleLaunch, RoleProcess, StageRequest, StagedRole, Transport,
    TransportFactory,
};

#[cfg(test)]
pub(crate) mod test_support {
    use std::fs;
    use std::path::Path;

    pub(crate) use cip_core::test_support::TempDirGuard;

    /// Writes an executable `/bin/sh` script and returns its path.
    #[cfg(unix)]
    pub(crate) fn write_script(dir: &Path, name: &str, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{}", body)).expect("write script");
        let mut perms = fs::metadata(&path).expect("script metadata").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).expect("chmod script");
        path.display().to_string()
    }
}
