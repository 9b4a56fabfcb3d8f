//! Session manager: the sole mutator of session state.
//!
//! Owns the mapping from session identifier to workspace, status, and
//! timestamps. The in-memory map is a projection of the authoritative
//! metadata files inside the workspaces; it is rebuilt from disk at startup
//! and refreshed from disk before a garbage-collection decision, so another
//! process touching a session (the terminal gateway) is never swept early.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::backend;
use crate::error::{Error, Result};
use crate::state::{Session, SessionStatus, SessionSummary};
use crate::workspace::{self, SessionMeta};

/// A process currently executing against a session's workspace.
#[derive(Debug, Clone)]
pub enum LiveProcess {
    /// Host-side child, identified by pid.
    Host(u32),
    /// Containerized child, identified by container name.
    Container(String),
}

/// Tracks in-flight executions per session so destroy can force-terminate
/// them before the workspace disappears underneath them.
#[derive(Default)]
pub struct ProcessRegistry {
    inner: Mutex<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    next_token: u64,
    live: HashMap<String, Vec<(u64, LiveProcess)>>,
}

impl ProcessRegistry {
    pub fn register(&self, session_id: &str, proc: LiveProcess) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        inner.next_token += 1;
        let token = inner.next_token;
        inner.live.entry(session_id.to_string()).or_default().push((token, proc));
        token
    }

    pub fn deregister(&self, session_id: &str, token: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(procs) = inner.live.get_mut(session_id) {
            procs.retain(|(t, _)| *t != token);
            if procs.is_empty() {
                inner.live.remove(session_id);
            }
        }
    }

    /// Remove and return everything registered against a session.
    pub fn take(&self, session_id: &str) -> Vec<LiveProcess> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .live
            .remove(session_id)
            .map(|procs| procs.into_iter().map(|(_, p)| p).collect())
            .unwrap_or_default()
    }
}

pub struct SessionManager {
    root: PathBuf,
    sessions: RwLock<HashMap<String, Session>>,
    pub processes: ProcessRegistry,
}

impl SessionManager {
    /// Open the workspace root and rebuild the session map from the metadata
    /// records found on disk.
    pub fn new(root: PathBuf) -> std::io::Result<Self> {
        std::fs::create_dir_all(&root)?;
        let mut sessions = HashMap::new();
        for meta in workspace::scan(&root) {
            let session = Session {
                workspace: workspace::path_for(&root, &meta.session_id),
                id: meta.session_id.clone(),
                user_id: meta.user_id,
                status: SessionStatus::Active,
                created_at: meta.created_at,
                last_used: meta.last_used,
            };
            sessions.insert(meta.session_id, session);
        }
        if !sessions.is_empty() {
            info!(count = sessions.len(), "restored sessions from disk");
        }
        Ok(Self {
            root,
            sessions: RwLock::new(sessions),
            processes: ProcessRegistry::default(),
        })
    }

    /// Allocate a fresh session for a user. The workspace is provisioned and
    /// seeded before the record becomes visible; a provisioning failure
    /// leaves nothing behind.
    pub async fn create(&self, user_id: &str) -> Result<Session> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let meta = SessionMeta {
            session_id: id.clone(),
            user_id: user_id.to_string(),
            created_at: now,
            last_used: now,
        };

        let workspace = match workspace::provision(&self.root, &meta) {
            Ok(ws) => ws,
            Err(e) => {
                // Roll back any partially created directory.
                let _ = workspace::remove(&workspace::path_for(&self.root, &id));
                return Err(Error::Workspace(e));
            }
        };

        let session = Session {
            id: id.clone(),
            user_id: user_id.to_string(),
            workspace,
            status: SessionStatus::Active,
            created_at: now,
            last_used: now,
        };
        self.sessions.write().await.insert(id.clone(), session.clone());
        info!(session_id = %id, user_id, "created session");
        Ok(session)
    }

    /// Look up an active session, enforcing ownership. A destroyed session
    /// is reported as not found, not as a filesystem error.
    pub async fn get_active(&self, session_id: &str, user_id: &str) -> Result<Session> {
        let sessions = self.sessions.read().await;
        let session = sessions.get(session_id).ok_or(Error::SessionNotFound)?;
        if session.status != SessionStatus::Active {
            return Err(Error::SessionNotFound);
        }
        if session.user_id != user_id {
            return Err(Error::NotOwner);
        }
        Ok(session.clone())
    }

    /// Bump a session's last-used timestamp, in the map and in the
    /// authoritative metadata file. Monotonic; metadata write failures are
    /// logged, never fatal.
    pub async fn touch(&self, session_id: &str) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(session_id) {
            if session.status != SessionStatus::Active {
                return;
            }
            let now = Utc::now();
            if now > session.last_used {
                session.last_used = now;
            }
            if let Err(e) = workspace::touch_meta(&session.workspace) {
                warn!(session_id, error = %e, "failed to persist last-used timestamp");
            }
        }
    }

    /// Destroy a session: kill anything still running against it, flip the
    /// authoritative status, then remove the workspace. Only the owner may
    /// destroy, except through the administrative bypass used by garbage
    /// collection. Idempotent: destroying a destroyed session succeeds.
    pub async fn destroy(&self, session_id: &str, user_id: &str, admin: bool) -> Result<()> {
        let workspace = {
            let mut sessions = self.sessions.write().await;
            let session = sessions.get_mut(session_id).ok_or(Error::SessionNotFound)?;
            if !admin && session.user_id != user_id {
                return Err(Error::NotOwner);
            }
            if session.status == SessionStatus::Destroyed {
                return Ok(());
            }
            session.status = SessionStatus::Destroyed;
            session.workspace.clone()
        };

        self.kill_live(session_id).await;

        let removal = tokio::task::spawn_blocking(move || workspace::remove(&workspace)).await;
        match removal {
            Ok(Ok(())) => info!(session_id, "destroyed session"),
            Ok(Err(e)) => warn!(session_id, error = %e, "workspace removal failed; status already destroyed"),
            Err(e) => warn!(session_id, error = %e, "workspace removal task failed"),
        }
        Ok(())
    }

    /// All sessions owned by a user, active and destroyed tombstones alike.
    pub async fn list(&self, user_id: &str) -> Vec<SessionSummary> {
        let sessions = self.sessions.read().await;
        let mut out: Vec<SessionSummary> = sessions
            .values()
            .filter(|s| s.user_id == user_id)
            .map(Session::summary)
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    /// Destroy every active session idle past the threshold. The on-disk
    /// metadata is consulted before each destroy so a bump performed by the
    /// terminal gateway process is honored.
    pub async fn sweep(&self, idle_ttl: Duration) {
        let idle_ttl = chrono::Duration::from_std(idle_ttl).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now() - idle_ttl;

        let candidates: Vec<(String, PathBuf)> = {
            let sessions = self.sessions.read().await;
            sessions
                .values()
                .filter(|s| s.status == SessionStatus::Active && s.last_used < cutoff)
                .map(|s| (s.id.clone(), s.workspace.clone()))
                .collect()
        };

        let mut destroyed = 0usize;
        for (id, ws) in candidates {
            if let Ok(meta) = workspace::read_meta(&ws) {
                if meta.last_used >= cutoff {
                    let mut sessions = self.sessions.write().await;
                    if let Some(s) = sessions.get_mut(&id) {
                        if meta.last_used > s.last_used {
                            s.last_used = meta.last_used;
                        }
                    }
                    continue;
                }
            }
            if self.destroy(&id, "", true).await.is_ok() {
                destroyed += 1;
            }
        }
        if destroyed > 0 {
            info!(destroyed, "garbage-collected idle sessions");
        }
    }

    /// Force-terminate everything registered against a session.
    async fn kill_live(&self, session_id: &str) {
        for proc in self.processes.take(session_id) {
            match proc {
                LiveProcess::Host(pid) => {
                    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                        warn!(session_id, pid, error = %e, "failed to kill in-flight process");
                    } else {
                        info!(session_id, pid, "killed in-flight process");
                    }
                }
                LiveProcess::Container(name) => {
                    backend::kill_container(&name).await;
                    info!(session_id, container = %name, "killed in-flight container");
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn force_last_used(&self, session_id: &str, ts: chrono::DateTime<Utc>) {
        let mut sessions = self.sessions.write().await;
        if let Some(s) = sessions.get_mut(session_id) {
            s.last_used = ts;
            let meta = SessionMeta {
                session_id: s.id.clone(),
                user_id: s.user_id.clone(),
                created_at: s.created_at,
                last_used: ts,
            };
            let _ = workspace::write_meta(&s.workspace, &meta);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (tempfile::TempDir, SessionManager) {
        let dir = tempfile::tempdir().unwrap();
        let mgr = SessionManager::new(dir.path().to_path_buf()).unwrap();
        (dir, mgr)
    }

    #[tokio::test]
    async fn create_seeds_workspace_and_record() {
        let (_dir, mgr) = manager();
        let session = mgr.create("u1").await.unwrap();

        assert!(session.workspace.join(workspace::WELCOME_FILE).is_file());
        assert!(session.workspace.join(workspace::DATA_DIR).is_dir());
        let fetched = mgr.get_active(&session.id, "u1").await.unwrap();
        assert_eq!(fetched.user_id, "u1");
    }

    #[tokio::test]
    async fn destroy_is_idempotent_and_removes_workspace() {
        let (_dir, mgr) = manager();
        let session = mgr.create("u1").await.unwrap();

        mgr.destroy(&session.id, "u1", false).await.unwrap();
        assert!(!session.workspace.exists());
        // Second destroy never errors and leaves nothing behind.
        mgr.destroy(&session.id, "u1", false).await.unwrap();
        assert!(!session.workspace.exists());
    }

    #[tokio::test]
    async fn destroy_requires_ownership_unless_admin() {
        let (_dir, mgr) = manager();
        let session = mgr.create("u1").await.unwrap();

        let err = mgr.destroy(&session.id, "u2", false).await.unwrap_err();
        assert!(matches!(err, Error::NotOwner));
        mgr.destroy(&session.id, "u2", true).await.unwrap();
    }

    #[tokio::test]
    async fn destroyed_session_is_reported_as_not_found() {
        let (_dir, mgr) = manager();
        let session = mgr.create("u1").await.unwrap();
        mgr.destroy(&session.id, "u1", false).await.unwrap();

        let err = mgr.get_active(&session.id, "u1").await.unwrap_err();
        assert!(matches!(err, Error::SessionNotFound));
    }

    #[tokio::test]
    async fn ownership_mismatch_is_rejected_before_lookup_success() {
        let (_dir, mgr) = manager();
        let session = mgr.create("u1").await.unwrap();
        let err = mgr.get_active(&session.id, "u2").await.unwrap_err();
        assert!(matches!(err, Error::NotOwner));
    }

    #[tokio::test]
    async fn list_includes_destroyed_tombstones() {
        let (_dir, mgr) = manager();
        let a = mgr.create("u1").await.unwrap();
        let b = mgr.create("u1").await.unwrap();
        mgr.create("u2").await.unwrap();
        mgr.destroy(&a.id, "u1", false).await.unwrap();

        let listed = mgr.list("u1").await;
        assert_eq!(listed.len(), 2);
        let a_entry = listed.iter().find(|s| s.id == a.id).unwrap();
        assert_eq!(a_entry.status, SessionStatus::Destroyed);
        let b_entry = listed.iter().find(|s| s.id == b.id).unwrap();
        assert_eq!(b_entry.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn sweep_destroys_idle_and_spares_fresh() {
        let (_dir, mgr) = manager();
        let stale = mgr.create("u1").await.unwrap();
        let fresh = mgr.create("u1").await.unwrap();
        mgr.force_last_used(&stale.id, Utc::now() - chrono::Duration::hours(48)).await;

        mgr.sweep(Duration::from_secs(86_400)).await;

        assert!(mgr.get_active(&stale.id, "u1").await.is_err());
        assert!(mgr.get_active(&fresh.id, "u1").await.is_ok());
        assert!(!stale.workspace.exists());
        assert!(fresh.workspace.exists());
    }

    #[tokio::test]
    async fn sweep_honors_gateway_side_touch() {
        let (_dir, mgr) = manager();
        let session = mgr.create("u1").await.unwrap();
        mgr.force_last_used(&session.id, Utc::now() - chrono::Duration::hours(48)).await;
        // Another process bumped the authoritative record on disk.
        workspace::touch_meta(&session.workspace).unwrap();

        mgr.sweep(Duration::from_secs(86_400)).await;

        assert!(mgr.get_active(&session.id, "u1").await.is_ok());
    }

    #[tokio::test]
    async fn restore_rebuilds_active_sessions_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let mgr = SessionManager::new(dir.path().to_path_buf()).unwrap();
            mgr.create("u1").await.unwrap().id
        };
        let mgr = SessionManager::new(dir.path().to_path_buf()).unwrap();
        let restored = mgr.get_active(&id, "u1").await.unwrap();
        assert_eq!(restored.id, id);
    }

    #[test]
    fn registry_register_deregister_take() {
        let reg = ProcessRegistry::default();
        let t1 = reg.register("s", LiveProcess::Host(42));
        let _t2 = reg.register("s", LiveProcess::Container("c".into()));
        reg.deregister("s", t1);

        let taken = reg.take("s");
        assert_eq!(taken.len(), 1);
        assert!(matches!(&taken[0], LiveProcess::Container(n) if n == "c"));
        assert!(reg.take("s").is_empty());
    }
}
