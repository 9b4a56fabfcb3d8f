//! Execution backends: containerized (docker) and local-restricted.
//!
//! The containerized path runs each command in a fresh, auto-removed
//! container with no network and hard memory/CPU ceilings. The local path is
//! a deliberately weaker fallback: tighter timeout, smaller output cap, a
//! scrubbed environment, and the deny-list filter applied by the executor
//! before anything is spawned.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::sessions::{LiveProcess, ProcessRegistry};

pub const CONTAINER_TIMEOUT: Duration = Duration::from_secs(30);
pub const LOCAL_TIMEOUT: Duration = Duration::from_secs(10);

pub const CONTAINER_OUTPUT_CAP: usize = 256 * 1024;
pub const LOCAL_OUTPUT_CAP: usize = 64 * 1024;

pub const CONTAINER_MEMORY: &str = "512m";
pub const CONTAINER_CPUS: &str = "1.0";

/// Working directory as seen from inside a container.
pub const CONTAINER_WORKDIR: &str = "/workspace";

/// Minimal PATH exposed to locally executed commands.
pub const LOCAL_PATH: &str = "/usr/bin:/bin";

/// Captured output of one command run, both streams always present.
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    pub stdout: String,
    pub stderr: String,
}

impl RunOutcome {
    fn stderr_only(message: String) -> Self {
        Self {
            stdout: String::new(),
            stderr: message,
        }
    }
}

/// Probe the container runtime. Any failure (missing binary, daemon down)
/// means "unavailable", never an error. Availability can change at any time,
/// so callers probe fresh on every execution rather than caching.
pub async fn container_available() -> bool {
    Command::new("docker")
        .arg("version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .is_ok_and(|s| s.success())
}

/// Best-effort kill of a named container.
pub async fn kill_container(name: &str) {
    let _ = Command::new("docker")
        .args(["kill", name])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
}

/// Run a command inside a fresh, auto-removed container with the session
/// workspace bind-mounted as its working directory.
///
/// `Err` means the runtime could not even be invoked (so the caller can
/// degrade to the local backend); everything that happens after a successful
/// spawn, including timeout, is reported inside the returned outcome.
pub async fn run_in_container(
    registry: &ProcessRegistry,
    session_id: &str,
    image: &str,
    workspace: &Path,
    command: &str,
) -> Result<RunOutcome, String> {
    let name = format!("playbox-{}", Uuid::new_v4());
    let mount = format!("{}:{}", workspace.display(), CONTAINER_WORKDIR);

    let mut cmd = Command::new("docker");
    cmd.args(["run", "--rm", "--name", &name])
        .args(["--network", "none"])
        .args(["--memory", CONTAINER_MEMORY])
        .args(["--cpus", CONTAINER_CPUS])
        .args(["-v", &mount])
        .args(["-w", CONTAINER_WORKDIR])
        .args([image, "sh", "-c", command])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(session_id, container = %name, image, "running command in container");
    let child = cmd.spawn().map_err(|e| format!("failed to invoke container runtime: {e}"))?;

    let token = registry.register(session_id, LiveProcess::Container(name.clone()));
    let waited = tokio::time::timeout(CONTAINER_TIMEOUT, child.wait_with_output()).await;
    registry.deregister(session_id, token);

    match waited {
        Ok(Ok(output)) => Ok(capture(output, CONTAINER_OUTPUT_CAP)),
        Ok(Err(e)) => Ok(RunOutcome::stderr_only(format!("container execution failed: {e}"))),
        Err(_) => {
            warn!(session_id, container = %name, "container command timed out");
            kill_container(&name).await;
            Ok(RunOutcome::stderr_only(format!(
                "command timed out after {}s",
                CONTAINER_TIMEOUT.as_secs()
            )))
        }
    }
}

/// Run a command through a restricted local shell: scrubbed environment,
/// working directory and HOME pinned to the workspace, reduced timeout and
/// output cap. The deny-list check happens in the executor before this is
/// called.
pub async fn run_local(
    registry: &ProcessRegistry,
    session_id: &str,
    workspace: &Path,
    command: &str,
) -> RunOutcome {
    run_host_process(registry, session_id, workspace, command, LOCAL_TIMEOUT, LOCAL_OUTPUT_CAP).await
}

async fn run_host_process(
    registry: &ProcessRegistry,
    session_id: &str,
    workspace: &Path,
    command: &str,
    timeout: Duration,
    cap: usize,
) -> RunOutcome {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(workspace)
        .env_clear()
        .env("PATH", LOCAL_PATH)
        .env("HOME", workspace)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(session_id, "running command locally");
    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => return RunOutcome::stderr_only(format!("failed to start command: {e}")),
    };

    let token = match child.id() {
        Some(pid) => Some(registry.register(session_id, LiveProcess::Host(pid))),
        None => None,
    };
    let waited = tokio::time::timeout(timeout, child.wait_with_output()).await;
    if let Some(token) = token {
        registry.deregister(session_id, token);
    }

    match waited {
        Ok(Ok(output)) => capture(output, cap),
        Ok(Err(e)) => RunOutcome::stderr_only(format!("command execution failed: {e}")),
        Err(_) => {
            warn!(session_id, "local command timed out");
            RunOutcome::stderr_only(format!("command timed out after {}s", timeout.as_secs()))
        }
    }
}

fn capture(output: std::process::Output, cap: usize) -> RunOutcome {
    RunOutcome {
        stdout: truncate_to(String::from_utf8_lossy(&output.stdout).into_owned(), cap),
        stderr: truncate_to(String::from_utf8_lossy(&output.stderr).into_owned(), cap),
    }
}

/// Cap a stream to `cap` bytes, marking the cut. Truncation lands on a char
/// boundary so multi-byte output cannot panic the capture path.
fn truncate_to(mut s: String, cap: usize) -> String {
    if s.len() > cap {
        let mut end = cap;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s.truncate(end);
        s.push_str("\n... [output truncated]");
    }
    s
}
