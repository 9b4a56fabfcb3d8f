//! Static deny-list filter for the local-restricted execution path.
//!
//! Best-effort defense in depth, not an isolation boundary. The containerized
//! backend is the real guarantee; this filter only narrows the blast radius
//! when commands run directly on the host. It is not applied on the container
//! path, which relies on isolation instead of text matching.

/// A command containing any of these substrings is rejected outright on the
/// local backend.
pub const DENIED_PATTERNS: &[&str] = &[
    // recursive deletion of the root filesystem
    "rm -rf /",
    "rm -fr /",
    // privilege escalation
    "sudo ",
    "su -",
    "su root",
    // kill-everything signals
    "kill -9 -1",
    "killall",
    // system / service control
    "shutdown",
    "reboot",
    "halt",
    "init 0",
    "init 6",
    "systemctl",
    "service ",
    // filesystem plumbing
    "umount ",
    "mount ",
    "mkfs",
    "dd of=/dev/",
    // fork bomb
    ":(){",
    // permission escalation against the root tree
    "chmod 777 /",
    "chmod -R 777 /",
    "chown root",
];

/// Check a command against the deny-list. Returns the matched pattern, or
/// `None` when the command is allowed. Never mutates the command.
pub fn denied(command: &str) -> Option<&'static str> {
    DENIED_PATTERNS.iter().copied().find(|p| command.contains(p))
}
