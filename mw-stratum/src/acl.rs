//! API-key access control.
//!
//! Keys live in a plain file, one per line; blank lines and lines shorter
//! than eight characters are discarded. The file is polled on a fixed
//! interval and reloaded only when its mtime increased. The loaded set is
//! replaced wholesale, never mutated in place, so a check observes either
//! the old or the new set fully. An empty configured path disables
//! checking entirely.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::SystemTime;

/// Minimum accepted key length.
const MIN_KEY_LEN: usize = 8;

pub struct AccessControl {
    enabled: bool,
    path: PathBuf,
    last_modified: Option<SystemTime>,
    keys: BTreeSet<String>,
}

impl AccessControl {
    pub fn new(path: Option<PathBuf>) -> Self {
        let mut acl = AccessControl {
            enabled: path.is_some(),
            path: path.unwrap_or_default(),
            last_modified: None,
            keys: BTreeSet::new(),
        };
        acl.refresh();
        acl
    }

    /// Reload the key file if its mtime advanced since the last load.
    pub fn refresh(&mut self) {
        if !self.enabled {
            return;
        }

        let modified = match std::fs::metadata(&self.path).and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(e) => {
                tracing::error!("stratum server: cannot stat {}: {}", self.path.display(), e);
                return;
            }
        };
        if let Some(last) = self.last_modified {
            if modified <= last {
                return;
            }
        }
        self.last_modified = Some(modified);

        match std::fs::read_to_string(&self.path) {
            Ok(contents) => {
                let keys: BTreeSet<String> = contents
                    .lines()
                    .map(str::trim)
                    .filter(|line| line.len() >= MIN_KEY_LEN)
                    .map(str::to_owned)
                    .collect();
                tracing::info!(
                    "stratum server: loaded {} api keys from {}",
                    keys.len(),
                    self.path.display()
                );
                self.keys = keys;
            }
            Err(e) => {
                tracing::error!("stratum server: cannot read {}: {}", self.path.display(), e);
            }
        }
    }

    /// Whether `key` may log in. O(log n).
    pub fn check(&self, key: &str) -> bool {
        if !self.enabled {
            return true;
        }
        self.keys.contains(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;

    fn write_keys(path: &std::path::Path, keys: &[&str]) {
        let mut file = fs::File::create(path).unwrap();
        for key in keys {
            writeln!(file, "{key}").unwrap();
        }
        file.sync_all().unwrap();
    }

    #[test]
    fn disabled_acl_accepts_everything() {
        let acl = AccessControl::new(None);
        assert!(acl.check("anything"));
        assert!(acl.check(""));
    }

    #[test]
    fn loads_keys_and_discards_short_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys");
        write_keys(&path, &["longenoughkey", "short", "", "  padded-key-x  "]);

        let acl = AccessControl::new(Some(path));
        assert!(acl.check("longenoughkey"));
        assert!(acl.check("padded-key-x"));
        assert!(!acl.check("short"));
        assert!(!acl.check("absent-key-12345"));
    }

    #[test]
    fn refresh_only_when_mtime_advances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys");
        write_keys(&path, &["first-api-key"]);

        let mut acl = AccessControl::new(Some(path.clone()));
        assert!(acl.check("first-api-key"));

        // Rewrite with a strictly newer mtime.
        write_keys(&path, &["second-api-key"]);
        let newer = SystemTime::now() + std::time::Duration::from_secs(2);
        let file = fs::File::open(&path).unwrap();
        file.set_modified(newer).unwrap();

        acl.refresh();
        assert!(acl.check("second-api-key"));
        assert!(!acl.check("first-api-key"));
    }

    #[test]
    fn missing_file_keeps_previous_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys");
        write_keys(&path, &["stable-api-key"]);

        let mut acl = AccessControl::new(Some(path.clone()));
        fs::remove_file(&path).unwrap();
        acl.refresh();
        assert!(acl.check("stable-api-key"));
    }
}
