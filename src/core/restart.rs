use log::warn;
use std::path::{Path, PathBuf};

/// File-backed flag that pauses background work until the process restarts.
#[derive(Debug, Clone)]
pub struct RestartGate {
    flag_path: PathBuf,
}

impl RestartGate {
    pub fn new(flag_path: impl Into<PathBuf>) -> Self {
        Self {
            flag_path: flag_path.into(),
        }
    }

    pub fn flag_path(&self) -> &Path {
        &self.flag_path
    }

    /// True when the flag exists, or when its directory cannot be inspected.
    pub fn is_pending(&self) -> bool {
        let dir = match self.flag_path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        if let Err(e) = std::fs::metadata(dir) {
            warn!(
                "Cannot stat restart flag directory {}: {}; assuming restart pending",
                dir.display(),
                e
            );
            return true;
        }
        match std::fs::metadata(&self.flag_path) {
            Ok(_) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                warn!("Cannot stat restart flag {}: {}", self.flag_path.display(), e);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_presence() {
        let dir = tempfile::tempdir().unwrap();
        let gate = RestartGate::new(dir.path().join("restart_required"));
        assert!(!gate.is_pending());
        std::fs::write(gate.flag_path(), b"").unwrap();
        assert!(gate.is_pending());
    }

    #[test]
    fn test_missing_directory_counts_as_pending() {
        let dir = tempfile::tempdir().unwrap();
        let gate = RestartGate::new(dir.path().join("gone").join("restart_required"));
        assert!(gate.is_pending());
    }
}
