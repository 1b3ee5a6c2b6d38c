//! Session Log Files
//!
//! Appends command transcripts to `logs/<session_id>.log`, rotating to
//! `<session_id>.<n>.log` when the active file reaches the size limit.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use chrono::Utc;
use tracing::{debug, warn};

/// Appender with size-based rotation.
pub struct SessionLogWriter {
    dir: PathBuf,
    max_bytes: u64,
}

impl SessionLogWriter {
    pub fn new(data_dir: &std::path::Path, max_log_size_mb: u64) -> Self {
        Self {
            dir: data_dir.join("logs"),
            max_bytes: max_log_size_mb.max(1) * 1024 * 1024,
        }
    }

    /// Append one command record. Failures are logged, never fatal.
    pub fn append(&self, session_id: &str, command: &str, output: &str, exit_code: i32) {
        if let Err(e) = self.try_append(session_id, command, output, exit_code) {
            warn!(session_id, "session log append failed: {e}");
        }
    }

    fn try_append(
        &self,
        session_id: &str,
        command: &str,
        output: &str,
        exit_code: i32,
    ) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.log_path(session_id);

        if let Ok(meta) = fs::metadata(&path) {
            if meta.len() >= self.max_bytes {
                self.rotate(session_id, &path)?;
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(
            file,
            "[{}] exit={exit_code} $ {command}\n{output}\n",
            Utc::now().to_rfc3339()
        )?;
        Ok(())
    }

    fn log_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.log"))
    }

    /// Move the active file to the next free `<session_id>.<n>.log` slot.
    fn rotate(&self, session_id: &str, active: &PathBuf) -> std::io::Result<()> {
        let mut n = 1u32;
        loop {
            let candidate = self.dir.join(format!("{session_id}.{n}.log"));
            if !candidate.exists() {
                fs::rename(active, &candidate)?;
                debug!(session_id, rotation = n, "rotated session log");
                return Ok(());
            }
            n += 1;
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
