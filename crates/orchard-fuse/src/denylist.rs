//! Thumbnailer suppression.
//!
//! Desktop thumbnail generators walk the whole tree opening every file; left
//! unchecked they would hydrate the entire remote store. Reads from a
//! process whose executable name matches the configured denylist are
//! answered without enqueueing any download — a first-class invariant, not
//! an optimization.

use std::collections::HashSet;

/// Matches requesting processes against the configured executable names.
pub struct ThumbnailerDenylist {
    names: HashSet<String>,
}

impl ThumbnailerDenylist {
    #[must_use]
    pub fn new(names: &[String]) -> Self {
        Self {
            names: names.iter().map(|n| n.to_string()).collect(),
        }
    }

    /// True when the pid's executable name (`/proc/<pid>/comm`) is denied.
    ///
    /// An unreadable comm (process already gone, permission) is never
    /// denied: suppressing a legitimate reader is worse than one stray
    /// hydration.
    #[must_use]
    pub fn is_denied(&self, pid: u32) -> bool {
        if self.names.is_empty() {
            return false;
        }
        match Self::comm_of(pid) {
            Some(comm) => self.is_denied_name(&comm),
            None => false,
        }
    }

    /// Name-level check, separated for tests.
    #[must_use]
    pub fn is_denied_name(&self, comm: &str) -> bool {
        self.names.contains(comm.trim())
    }

    fn comm_of(pid: u32) -> Option<String> {
        std::fs::read_to_string(format!("/proc/{}/comm", pid)).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn denylist() -> ThumbnailerDenylist {
        ThumbnailerDenylist::new(&[
            "ffmpeg-thumbnailer".to_string(),
            "evince-thumbnailer".to_string(),
        ])
    }

    #[test]
    fn test_matches_exact_name() {
        let d = denylist();
        assert!(d.is_denied_name("ffmpeg-thumbnailer"));
        assert!(d.is_denied_name("evince-thumbnailer"));
        assert!(!d.is_denied_name("vim"));
    }

    #[test]
    fn test_trims_comm_newline() {
        // /proc/<pid>/comm carries a trailing newline.
        assert!(denylist().is_denied_name("ffmpeg-thumbnailer\n"));
    }

    #[test]
    fn test_no_substring_matching() {
        // Only exact executable names are suppressed.
        assert!(!denylist().is_denied_name("ffmpeg"));
        assert!(!denylist().is_denied_name("my-ffmpeg-thumbnailer-fork"));
    }

    #[test]
    fn test_own_pid_is_not_a_thumbnailer() {
        assert!(!denylist().is_denied(std::process::id()));
    }

    #[test]
    fn test_empty_denylist_denies_nothing() {
        let d = ThumbnailerDenylist::new(&[]);
        assert!(!d.is_denied_name("ffmpeg-thumbnailer"));
        assert!(!d.is_denied(1));
    }
}
