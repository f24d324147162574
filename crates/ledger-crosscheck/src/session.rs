//! Cached authentication state for one site, stored as a JSON file.
//!
//! The file's modification time is the capture time. Sessions are rotated once they
//! are older than the configured maximum age: long-lived cookie jars keep growing
//! and some sites start rejecting the oversized `Cookie` header.

use std::io::{ErrorKind, Write as _};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tempfile::NamedTempFile;

use crate::error::SessionError;

pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct SessionArtifact {
    pub path: PathBuf,
    pub captured_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl SessionArtifact {
    pub fn age_at(&self, now: DateTime<Utc>) -> chrono::TimeDelta {
        now - self.captured_at
    }

    pub fn is_stale_at(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        match chrono::TimeDelta::from_std(max_age) {
            Ok(max_age) => self.age_at(now) > max_age,
            // an unrepresentable maximum never expires
            Err(_) => false,
        }
    }

    pub fn is_stale(&self, max_age: Duration) -> bool {
        self.is_stale_at(Utc::now(), max_age)
    }
}

/// The session file of a single site. Running two checks against the same path at
/// the same time is not supported.
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        SessionStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the cached session. A missing file is not an error.
    pub fn load(&self) -> Result<Option<SessionArtifact>, SessionError> {
        let contents = match std::fs::read(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_error(e)),
        };
        let modified = std::fs::metadata(&self.path)
            .and_then(|metadata| metadata.modified())
            .map_err(|e| self.io_error(e))?;

        let payload = match serde_json::from_slice(&contents) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), "ignoring unreadable session artifact: {e}");
                return Ok(None);
            }
        };

        Ok(Some(SessionArtifact {
            path: self.path.clone(),
            captured_at: DateTime::<Utc>::from(modified),
            payload,
        }))
    }

    /// Replace the artifact. The payload is written to a sibling temp file first and
    /// renamed into place, so readers see either the old or the new file.
    pub fn save(&self, payload: &serde_json::Value) -> Result<(), SessionError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir).map_err(|e| self.io_error(e))?;

        let data = serde_json::to_vec_pretty(payload)?;
        let mut file = NamedTempFile::new_in(dir).map_err(|e| self.io_error(e))?;
        file.write_all(&data).map_err(|e| self.io_error(e))?;
        file.as_file().sync_all().map_err(|e| self.io_error(e))?;
        file.persist(&self.path).map_err(|e| self.io_error(e.error))?;

        tracing::info!(path = %self.path.display(), "session saved");
        Ok(())
    }

    /// Delete the artifact. Deleting a missing artifact is a no-op.
    pub fn invalidate(&self) -> Result<(), SessionError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::info!(path = %self.path.display(), "deleted cached session");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_error(e)),
        }
    }

    fn io_error(&self, source: std::io::Error) -> SessionError {
        SessionError::Io {
            path: self.path.clone(),
            source,
        }
    }
}
