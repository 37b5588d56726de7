//! Per-dataset health files. Every scheduled job writes one at exit; the
//! serving API reads them back as its scraper-health endpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Success,
    Failure,
    Timeout,
}

impl JobStatus {
    pub fn exit_code(&self) -> i32 {
        match self {
            JobStatus::Success => 0,
            JobStatus::Failure => 1,
            JobStatus::Timeout => 124,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: JobStatus,
    pub dataset: String,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    pub items_processed: u64,
    pub error_count: u64,
    pub exit_code: i32,
    pub log_path: Option<String>,
}

impl HealthReport {
    pub fn new(dataset: &str, started: DateTime<Utc>) -> Self {
        HealthReport {
            status: JobStatus::Failure,
            dataset: dataset.to_string(),
            started,
            finished: started,
            items_processed: 0,
            error_count: 0,
            exit_code: 1,
            log_path: None,
        }
    }

    pub fn finish(mut self, status: JobStatus) -> Self {
        self.status = status;
        self.exit_code = status.exit_code();
        self.finished = Utc::now();
        self
    }

    pub fn path_for(dir: &Path, dataset: &str) -> PathBuf {
        dir.join(format!("{}_health.json", dataset))
    }

    /// Write the report to `<dir>/<dataset>_health.json`. Failures to
    /// write are reported to the caller; a job must not die because its
    /// health file could not be written.
    pub fn write_to(&self, dir: &Path) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = Self::path_for(dir, &self.dataset);
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(path)
    }

    pub fn load(dir: &Path, dataset: &str) -> Option<HealthReport> {
        let raw = std::fs::read_to_string(Self::path_for(dir, dataset)).ok()?;
        serde_json::from_str(&raw).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let report = HealthReport {
            items_processed: 42,
            error_count: 3,
            ..HealthReport::new("enabavki_active", Utc::now())
        }
        .finish(JobStatus::Success);

        let path = report.write_to(dir.path()).unwrap();
        assert!(path.ends_with("enabavki_active_health.json"));

        let loaded = HealthReport::load(dir.path(), "enabavki_active").unwrap();
        assert_eq!(loaded.status, JobStatus::Success);
        assert_eq!(loaded.exit_code, 0);
        assert_eq!(loaded.items_processed, 42);
    }

    #[test]
    fn timeout_maps_to_124() {
        let report = HealthReport::new("docs", Utc::now()).finish(JobStatus::Timeout);
        assert_eq!(report.exit_code, 124);
    }
}
