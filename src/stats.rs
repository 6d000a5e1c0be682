//! Persisted suite duration history.
//!
//! The stats file is the memory between runs: it is read once at startup to
//! sort the initial queue and written once at shutdown with the durations
//! observed during the run. A missing or unreadable file just means an empty
//! history.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::protocol::SuiteId;

/// One persisted entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteRecord {
    pub name: String,
    pub path: std::path::PathBuf,
    pub duration_seconds: f64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StatsFile {
    suites: Vec<SuiteRecord>,
}

/// In-memory view of the stats file.
#[derive(Debug, Default)]
pub struct SuiteStats {
    durations: HashMap<SuiteId, f64>,
}

impl SuiteStats {
    /// Load stats from `path`, degrading to an empty history on any error.
    pub fn load(path: &Path) -> Self {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(_) => return Self::default(),
        };

        match serde_json::from_str::<StatsFile>(&content) {
            Ok(file) => {
                let durations = file
                    .suites
                    .into_iter()
                    .map(|r| (SuiteId::new(r.name, r.path), r.duration_seconds))
                    .collect();
                Self { durations }
            }
            Err(e) => {
                warn!("Ignoring unreadable stats file {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Write the history back out.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let mut suites: Vec<SuiteRecord> = self
            .durations
            .iter()
            .map(|(id, duration)| SuiteRecord {
                name: id.name.clone(),
                path: id.path.clone(),
                duration_seconds: *duration,
            })
            .collect();
        // Stable file contents regardless of hash order.
        suites.sort_by(|a, b| (&a.name, &a.path).cmp(&(&b.name, &b.path)));

        let file = StatsFile { suites };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        std::fs::write(path, json)
    }

    pub fn duration(&self, id: &SuiteId) -> Option<f64> {
        self.durations.get(id).copied()
    }

    /// Observed duration for this run; overwrites any stored value.
    pub fn record(&mut self, id: &SuiteId, duration_seconds: f64) {
        self.durations.insert(id.clone(), duration_seconds);
    }

    pub fn known_suites(&self) -> impl Iterator<Item = (&SuiteId, f64)> {
        self.durations.iter().map(|(id, d)| (id, *d))
    }

    pub fn len(&self) -> usize {
        self.durations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.durations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let stats = SuiteStats::load(&dir.path().join("nope"));
        assert!(stats.is_empty());
    }

    #[test]
    fn test_corrupt_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stats.json");
        std::fs::write(&path, "not json {").unwrap();
        assert!(SuiteStats::load(&path).is_empty());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stats.json");

        let a = SuiteId::new("A", "test/a.rs");
        let b = SuiteId::new("B", "test/b.rs");

        let mut stats = SuiteStats::default();
        stats.record(&a, 5.0);
        stats.record(&b, 3.25);
        stats.save(&path).unwrap();

        let loaded = SuiteStats::load(&path);
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.duration(&a), Some(5.0));
        assert_eq!(loaded.duration(&b), Some(3.25));
    }

    #[test]
    fn test_record_overwrites() {
        let a = SuiteId::new("A", "test/a.rs");
        let mut stats = SuiteStats::default();
        stats.record(&a, 5.0);
        stats.record(&a, 2.0);
        assert_eq!(stats.duration(&a), Some(2.0));
    }
}
