//! Shared application state and session types.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::Config;
use crate::sessions::SessionManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Destroyed,
}

/// One user's isolated workspace plus its lifecycle metadata.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    /// Exclusively owned by this session; never shared.
    pub workspace: PathBuf,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

impl Session {
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            status: self.status,
            created_at: self.created_at,
            last_used: self.last_used,
        }
    }
}

/// Wire representation for session listings.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

/// Shared application state for the API process.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub config: Arc<Config>,
}
