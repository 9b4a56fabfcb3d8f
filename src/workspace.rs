//! Workspace store: per-session directories on persistent local storage.
//!
//! Pure filesystem operations. The authoritative per-session record is a
//! metadata file inside the workspace itself, so the directory tree can be
//! scanned to rebuild session state after a restart. All creation and
//! destruction is serialized through the session manager.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const META_FILE: &str = ".session.json";
pub const WELCOME_FILE: &str = "README.txt";
pub const DATA_DIR: &str = "data";

/// Directory listings returned to callers are capped at this many entries.
pub const LISTING_CAP: usize = 20;

/// Authoritative session record, stored inside the workspace directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    pub session_id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

pub fn path_for(root: &Path, session_id: &str) -> PathBuf {
    root.join(session_id)
}

/// Create and seed a workspace: welcome file, empty data subdirectory, and
/// the session metadata record. Any I/O failure is fatal to the call; the
/// caller must not record the session unless this succeeds.
pub fn provision(root: &Path, meta: &SessionMeta) -> io::Result<PathBuf> {
    let ws = path_for(root, &meta.session_id);
    fs::create_dir_all(ws.join(DATA_DIR))?;
    fs::write(
        ws.join(WELCOME_FILE),
        format!(
            "Welcome to your sandbox.\n\n\
             Session: {}\n\
             Everything you create lives under this directory and disappears\n\
             when the session is destroyed. Use data/ for scratch files.\n",
            meta.session_id
        ),
    )?;
    write_meta(&ws, meta)?;
    Ok(ws)
}

pub fn write_meta(ws: &Path, meta: &SessionMeta) -> io::Result<()> {
    let json = serde_json::to_vec_pretty(meta).map_err(io::Error::other)?;
    fs::write(ws.join(META_FILE), json)
}

pub fn read_meta(ws: &Path) -> io::Result<SessionMeta> {
    let raw = fs::read(ws.join(META_FILE))?;
    serde_json::from_slice(&raw).map_err(io::Error::other)
}

/// Bump the recorded last-used timestamp. Monotonic: an earlier `now` (clock
/// step) never rewinds the stored value.
pub fn touch_meta(ws: &Path) -> io::Result<()> {
    let mut meta = read_meta(ws)?;
    let now = Utc::now();
    if now > meta.last_used {
        meta.last_used = now;
    }
    write_meta(ws, &meta)
}

/// Remove a workspace recursively. A directory that is already missing is
/// fine: destroy is idempotent.
pub fn remove(ws: &Path) -> io::Result<()> {
    match fs::remove_dir_all(ws) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Type-prefixed directory listing, capped at [`LISTING_CAP`] entries. The
/// metadata file is internal and excluded. A read failure yields a single
/// diagnostic entry instead of failing the caller.
pub fn listing(ws: &Path) -> Vec<String> {
    let entries = match fs::read_dir(ws) {
        Ok(rd) => rd,
        Err(e) => return vec![format!("[unreadable: {e}]")],
    };
    let mut names: Vec<String> = entries
        .filter_map(|entry| {
            let entry = entry.ok()?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == META_FILE {
                return None;
            }
            let kind = match entry.file_type() {
                Ok(t) if t.is_dir() => "dir",
                _ => "file",
            };
            Some(format!("{kind}: {name}"))
        })
        .collect();
    names.sort();
    names.truncate(LISTING_CAP);
    names
}

/// Scan the workspace root and return every restorable session record.
/// Directories without a readable metadata file are skipped with a warning;
/// they are not ours to manage.
pub fn scan(root: &Path) -> Vec<SessionMeta> {
    let entries = match fs::read_dir(root) {
        Ok(rd) => rd,
        Err(_) => return Vec::new(),
    };
    let mut found = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        match read_meta(&path) {
            Ok(meta) => found.push(meta),
            Err(e) => warn!(path = %path.display(), error = %e, "skipping directory without session metadata"),
        }
    }
    found
}
