//! Environment-driven service configuration.

use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_WORKSPACE_ROOT: &str = "/var/lib/playbox/workspaces";
pub const DEFAULT_IMAGE: &str = "ubuntu:24.04";
pub const DEFAULT_IDLE_TTL_SECS: u64 = 86_400;

#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory under which every session workspace lives.
    pub workspace_root: PathBuf,
    /// Container image used by the hardened backend.
    pub image: String,
    /// Sessions idle longer than this are garbage-collected.
    pub idle_ttl: Duration,
    /// HMAC signing secret for terminal tickets.
    pub ticket_secret: Vec<u8>,
    /// Production deployments prefer the containerized backend.
    pub production: bool,
}

impl Config {
    /// Read configuration from the environment. Everything has a default
    /// except the ticket secret, which must be provided.
    pub fn from_env() -> Result<Self, String> {
        let workspace_root = std::env::var("PLAYBOX_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_WORKSPACE_ROOT));

        let image = std::env::var("PLAYBOX_IMAGE").unwrap_or_else(|_| DEFAULT_IMAGE.to_string());

        let idle_ttl = std::env::var("PLAYBOX_IDLE_TTL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(DEFAULT_IDLE_TTL_SECS));

        let ticket_secret = std::env::var("PLAYBOX_TICKET_SECRET")
            .map(String::into_bytes)
            .map_err(|_| "PLAYBOX_TICKET_SECRET must be set".to_string())?;
        if ticket_secret.len() < 16 {
            return Err("PLAYBOX_TICKET_SECRET must be at least 16 bytes".to_string());
        }

        let production = std::env::var("PLAYBOX_ENV")
            .map(|v| v == "production")
            .unwrap_or(false);

        Ok(Self {
            workspace_root,
            image,
            idle_ttl,
            ticket_secret,
            production,
        })
    }
}
