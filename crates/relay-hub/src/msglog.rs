use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

/// Append-only, line-oriented message log. One line per accepted
/// update; write failures are logged and never fail ingestion.
pub struct MessageLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl MessageLog {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open message log {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn append(&self, line: &str) {
        let mut file = match self.file.lock() {
            Ok(file) => file,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(err) = writeln!(file, "{line}") {
            warn!(event = "message_log_error", path = %self.path.display(), error = %err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_the_file_and_append_adds_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("messages.log");
        let log = MessageLog::open(&path).unwrap();
        log.append("[2026-01-01 09:00:00] [UpdateID: 1] [ChatID: 42] Ada: hi");
        log.append("[2026-01-01 09:00:01] [UpdateID: 2] [ChatID: 42] Ada: again");

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("Ada: hi"));
    }

    #[test]
    fn reopening_appends_rather_than_truncates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("messages.log");
        MessageLog::open(&path).unwrap().append("first");
        MessageLog::open(&path).unwrap().append("second");

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
    }
}
