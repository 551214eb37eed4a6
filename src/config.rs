//! Configuration management.
//!
//! Settings come from an optional TOML file layered over built-in defaults;
//! the CLI only overrides the prefix and data root (see `main.rs`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::Config;
use serde::Deserialize;

use crate::error::{EngineError, EngineResult};

/// What to do with a chassis that ended a run with other than exactly one
/// capture file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DegradedChassisPolicy {
    /// Decode whatever files were discovered, in name order. Zero files
    /// yields empty artifacts.
    Convert,
    /// Leave the chassis unconverted; its signals get no output artifact.
    Skip,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Global remote-value name prefix.
    pub prefix: String,
    /// Root of the run directory tree.
    pub data_root: PathBuf,
    pub log_level: String,
    /// Wait after disabling acquisition before trusting the directory
    /// listing, so in-flight packets can land on disk.
    #[serde(with = "humantime_serde")]
    pub flush_grace: Duration,
    /// Upper bound on terminal cleanup, so a stalled hardware link cannot
    /// hang shutdown.
    #[serde(with = "humantime_serde")]
    pub cleanup_timeout: Duration,
    pub degraded_chassis: DegradedChassisPolicy,
    /// Capture files kept per retention pattern; 0 disables eviction.
    pub retention_count: usize,
    /// Glob patterns grouping spool files for retention; first match wins.
    pub retention_patterns: Vec<String>,
    /// Spool directories the retention watcher observes.
    pub spool_dirs: Vec<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            prefix: "FDAS:".to_string(),
            data_root: PathBuf::from("/data"),
            log_level: "info".to_string(),
            flush_grace: Duration::from_secs(5),
            cleanup_timeout: Duration::from_secs(5),
            degraded_chassis: DegradedChassisPolicy::Convert,
            retention_count: 0,
            retention_patterns: vec!["*.dat".to_string()],
            spool_dirs: Vec::new(),
        }
    }
}

impl Settings {
    /// Load settings, layering the file (if given) over defaults.
    pub fn load(path: Option<&Path>) -> EngineResult<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let cfg = builder.build()?;
        cfg.try_deserialize().map_err(EngineError::Config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_a_file() {
        let settings = Settings::load(None).unwrap();
        assert_eq!(settings.prefix, "FDAS:");
        assert_eq!(settings.flush_grace, Duration::from_secs(5));
        assert_eq!(settings.degraded_chassis, DegradedChassisPolicy::Convert);
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(
            &path,
            r#"
                prefix = "TEST:"
                flush_grace = "250ms"
                degraded_chassis = "skip"
            "#,
        )
        .unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.prefix, "TEST:");
        assert_eq!(settings.flush_grace, Duration::from_millis(250));
        assert_eq!(settings.degraded_chassis, DegradedChassisPolicy::Skip);
        // Untouched keys keep their defaults.
        assert_eq!(settings.data_root, PathBuf::from("/data"));
    }
}
