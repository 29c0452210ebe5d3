//! Runtime filesystem layout.
//!
//! Everything the backend persists lives under one root directory (default
//! `.finagent`, overridable via `FIN_AGENT_HOME`). Created once at startup
//! and never mutated afterwards.

use std::env;
use std::path::{Path, PathBuf};

use crate::error::FinResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePaths {
    root: PathBuf,
}

impl Default for RuntimePaths {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".finagent"),
        }
    }
}

impl RuntimePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve the root from `FIN_AGENT_HOME`, falling back to `.finagent`.
    pub fn from_env() -> Self {
        match env::var("FIN_AGENT_HOME") {
            Ok(value) if !value.trim().is_empty() => Self::new(value),
            _ => Self::default(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_db_path(&self) -> PathBuf {
        self.root.join("state.sqlite")
    }

    pub fn analytics_db_path(&self) -> PathBuf {
        self.root.join("analytics.duckdb")
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.root.join("artifacts")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn structured_log_path(&self) -> PathBuf {
        self.logs_dir().join("structured.log")
    }

    /// Create the root, artifacts and logs directories if missing.
    pub fn ensure(&self) -> FinResult<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.artifacts_dir())?;
        std::fs::create_dir_all(self.logs_dir())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_paths() {
        let paths = RuntimePaths::new("/tmp/fin-home");
        assert_eq!(paths.state_db_path(), PathBuf::from("/tmp/fin-home/state.sqlite"));
        assert_eq!(
            paths.analytics_db_path(),
            PathBuf::from("/tmp/fin-home/analytics.duckdb")
        );
        assert_eq!(paths.artifacts_dir(), PathBuf::from("/tmp/fin-home/artifacts"));
        assert_eq!(
            paths.structured_log_path(),
            PathBuf::from("/tmp/fin-home/logs/structured.log")
        );
    }

    #[test]
    fn test_ensure_creates_layout() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RuntimePaths::new(dir.path().join("agent"));
        paths.ensure().unwrap();
        assert!(paths.artifacts_dir().is_dir());
        assert!(paths.logs_dir().is_dir());
    }
}
