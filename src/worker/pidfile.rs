//! PID file for worker processes launched by the supervisor.
//!
//! One process id per line. The file outlives the CLI invocation that wrote
//! it so a later `worker stop` can find the workers.

use std::io;
use std::path::{Path, PathBuf};

use tracing::warn;

#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Recorded PIDs. A missing file is empty; unparsable lines are skipped.
    pub fn load(&self) -> io::Result<Vec<u32>> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        Ok(contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .filter_map(|line| match line.parse::<u32>() {
                Ok(pid) if pid > 0 => Some(pid),
                _ => {
                    warn!(path = %self.path.display(), line, "Skipping invalid PID file entry");
                    None
                }
            })
            .collect())
    }

    /// Replace the file's contents with `pids`.
    pub fn save(&self, pids: &[u32]) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut contents = String::new();
        for pid in pids {
            contents.push_str(&pid.to_string());
            contents.push('\n');
        }
        std::fs::write(&self.path, contents)
    }

    /// Remove the file. No-op if it does not exist.
    pub fn clear(&self) -> io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}
