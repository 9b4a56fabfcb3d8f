//! Command executor: run one command against a session's workspace under
//! enforced limits, with identical external behavior regardless of backend.
//!
//! Only precondition failures ever surface as errors. A command that exits
//! non-zero, times out, or trips the deny-list is normal output, reported
//! inside the result's stderr.

use std::time::Instant;

use serde::Serialize;
use tracing::{debug, warn};

use crate::backend;
use crate::error::{Error, Result};
use crate::sanitizer;
use crate::state::AppState;
use crate::workspace;

/// Result of one execution, ephemeral to the request.
#[derive(Debug, Clone, Serialize)]
pub struct ExecOutcome {
    pub stdout: String,
    pub stderr: String,
    /// Working directory as seen inside the execution environment.
    pub cwd: String,
    /// Bounded, type-prefixed workspace listing.
    pub listing: Vec<String>,
    pub elapsed_ms: u64,
    /// Whether the containerized backend ran this command.
    pub containerized: bool,
}

pub async fn execute(
    state: &AppState,
    session_id: &str,
    user_id: &str,
    command: &str,
) -> Result<ExecOutcome> {
    if command.trim().is_empty() {
        return Err(Error::EmptyCommand);
    }
    let session = state.manager.get_active(session_id, user_id).await?;

    // Runtime availability can change at any time; probe fresh per call.
    let want_container = state.config.production && backend::container_available().await;

    let started = Instant::now();
    let (outcome, containerized) = if want_container {
        match backend::run_in_container(
            &state.manager.processes,
            session_id,
            &state.config.image,
            &session.workspace,
            command,
        )
        .await
        {
            Ok(outcome) => (outcome, true),
            Err(reason) => {
                warn!(session_id, %reason, "container runtime failed mid-call, degrading to local backend");
                (run_local_restricted(state, session_id, &session, command).await, false)
            }
        }
    } else {
        (run_local_restricted(state, session_id, &session, command).await, false)
    };
    let elapsed_ms = started.elapsed().as_millis() as u64;

    let cwd = if containerized {
        backend::CONTAINER_WORKDIR.to_string()
    } else {
        session.workspace.display().to_string()
    };
    let listing = workspace::listing(&session.workspace);
    state.manager.touch(session_id).await;

    debug!(session_id, containerized, elapsed_ms, "command finished");
    Ok(ExecOutcome {
        stdout: outcome.stdout,
        stderr: outcome.stderr,
        cwd,
        listing,
        elapsed_ms,
        containerized,
    })
}

/// The weaker fallback path: deny-list first, then a restricted shell.
/// A rejection is surfaced as stderr content; no process is spawned.
async fn run_local_restricted(
    state: &AppState,
    session_id: &str,
    session: &crate::state::Session,
    command: &str,
) -> backend::RunOutcome {
    match sanitizer::denied(command) {
        Some(pattern) => backend::RunOutcome {
            stdout: String::new(),
            stderr: format!("command rejected: contains restricted pattern {pattern:?}"),
        },
        None => {
            backend::run_local(&state.manager.processes, session_id, &session.workspace, command)
                .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::sessions::SessionManager;
    use std::sync::Arc;
    use std::time::Duration;

    fn test_state() -> (tempfile::TempDir, AppState) {
        let dir = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(dir.path().to_path_buf()).unwrap();
        let config = Config {
            workspace_root: dir.path().to_path_buf(),
            image: "ubuntu:24.04".to_string(),
            idle_ttl: Duration::from_secs(86_400),
            ticket_secret: b"unit-test-secret-0123456789".to_vec(),
            production: false,
        };
        let state = AppState {
            manager: Arc::new(manager),
            config: Arc::new(config),
        };
        (dir, state)
    }

    #[tokio::test]
    async fn echo_round_trip_on_local_backend() {
        let (_dir, state) = test_state();
        let session = state.manager.create("u1").await.unwrap();

        let out = execute(&state, &session.id, "u1", "echo hello").await.unwrap();
        assert_eq!(out.stdout, "hello\n");
        assert_eq!(out.stderr, "");
        assert!(!out.containerized);
        assert!(out.listing.contains(&format!("file: {}", workspace::WELCOME_FILE)));
        assert_eq!(out.cwd, session.workspace.display().to_string());
    }

    #[tokio::test]
    async fn empty_command_is_a_precondition_failure() {
        let (_dir, state) = test_state();
        let session = state.manager.create("u1").await.unwrap();
        let err = execute(&state, &session.id, "u1", "   ").await.unwrap_err();
        assert!(matches!(err, Error::EmptyCommand));
    }

    #[tokio::test]
    async fn unknown_session_is_rejected() {
        let (_dir, state) = test_state();
        let err = execute(&state, "missing", "u1", "echo hi").await.unwrap_err();
        assert!(matches!(err, Error::SessionNotFound));
    }

    #[tokio::test]
    async fn foreign_owner_is_rejected_before_execution() {
        let (_dir, state) = test_state();
        let session = state.manager.create("u1").await.unwrap();
        let err = execute(&state, &session.id, "u2", "echo hi").await.unwrap_err();
        assert!(matches!(err, Error::NotOwner));
    }

    #[tokio::test]
    async fn denied_command_is_rejected_without_touching_the_workspace() {
        let (_dir, state) = test_state();
        let session = state.manager.create("u1").await.unwrap();
        let before = workspace::listing(&session.workspace);

        let out = execute(&state, &session.id, "u1", "chmod 777 /").await.unwrap();
        assert!(out.stderr.contains("restricted pattern"));
        assert!(out.stderr.contains("chmod 777 /"));
        assert_eq!(out.stdout, "");
        assert_eq!(workspace::listing(&session.workspace), before);
    }

    #[tokio::test]
    async fn failing_command_is_output_not_error() {
        let (_dir, state) = test_state();
        let session = state.manager.create("u1").await.unwrap();

        let out = execute(&state, &session.id, "u1", "ls /no/such/path").await.unwrap();
        assert!(!out.stderr.is_empty());
    }

    #[tokio::test]
    async fn sessions_cannot_reach_each_other() {
        let (_dir, state) = test_state();
        let a = state.manager.create("u1").await.unwrap();
        let b = state.manager.create("u2").await.unwrap();

        execute(&state, &a.id, "u1", "echo intruder > stolen.txt").await.unwrap();
        assert!(a.workspace.join("stolen.txt").is_file());
        assert!(!b.workspace.join("stolen.txt").exists());
    }

    #[tokio::test]
    async fn execution_bumps_last_used() {
        let (_dir, state) = test_state();
        let session = state.manager.create("u1").await.unwrap();
        let before = state.manager.get_active(&session.id, "u1").await.unwrap().last_used;

        execute(&state, &session.id, "u1", "echo hi").await.unwrap();
        let after = state.manager.get_active(&session.id, "u1").await.unwrap().last_used;
        assert!(after >= before);
    }
}
