//! The scheduled-job registry: which binary runs for which dataset, its
//! wall-clock limit, and the schedule the external cron honors. The
//! schedule strings are the contract — the orchestrator does not run its
//! own timer loop, cron (or systemd timers) invokes `orchestrator run`.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct JobSpec {
    pub name: &'static str,
    pub dataset: &'static str,
    pub binary: &'static str,
    pub args: &'static [&'static str],
    pub timeout: Duration,
    /// Cron expression documenting the schedule invariant.
    pub schedule: &'static str,
    pub note: &'static str,
}

const CRAWL_TIMEOUT: Duration = Duration::from_secs(9000); // 2.5h
const DOC_TIMEOUT: Duration = Duration::from_secs(7200); // 2h

pub const JOBS: &[JobSpec] = &[
    JobSpec {
        name: "active_crawl",
        dataset: "enabavki_active",
        binary: "nabavki_crawler",
        args: &["--category", "active"],
        timeout: CRAWL_TIMEOUT,
        schedule: "0 */4 * * *",
        note: "active tenders, every 4 hours",
    },
    JobSpec {
        name: "awarded_crawl",
        dataset: "enabavki_awarded",
        binary: "nabavki_crawler",
        args: &["--category", "awarded"],
        timeout: CRAWL_TIMEOUT,
        schedule: "30 1 * * *",
        note: "awarded contracts, once daily off-peak",
    },
    JobSpec {
        name: "cancelled_crawl",
        dataset: "enabavki_cancelled",
        binary: "nabavki_crawler",
        args: &["--category", "cancelled"],
        timeout: CRAWL_TIMEOUT,
        schedule: "50 1 * * *",
        note: "cancelled procedures, once daily off-peak",
    },
    JobSpec {
        name: "historical_backfill",
        dataset: "enabavki_historical",
        binary: "nabavki_crawler",
        args: &["--category", "historical"],
        timeout: CRAWL_TIMEOUT,
        schedule: "0 3 * * 6,0",
        note: "archive years, weekends only, resumes from cursor",
    },
    JobSpec {
        name: "epazar_crawl",
        dataset: "epazar_all",
        binary: "epazar_crawler",
        args: &["--category", "all"],
        timeout: CRAWL_TIMEOUT,
        schedule: "15 2 * * *",
        note: "e-pazar listings and evaluation reports, once daily",
    },
    JobSpec {
        name: "documents",
        dataset: "documents",
        binary: "doc_processor",
        args: &[],
        timeout: DOC_TIMEOUT,
        schedule: "0 */2 * * *",
        note: "document download and extraction, every 2 hours",
    },
    JobSpec {
        name: "risk_analysis",
        dataset: "risk_analysis",
        binary: "risk_analyzer",
        args: &["analyze"],
        timeout: DOC_TIMEOUT,
        schedule: "0 4 * * *",
        note: "full flag refresh plus materialized views, daily off-peak",
    },
    JobSpec {
        name: "lifecycle",
        dataset: "lifecycle",
        binary: "orchestrator",
        args: &["lifecycle"],
        timeout: Duration::from_secs(600),
        schedule: "10 0 * * *",
        note: "auto-close expired open tenders, daily",
    },
];

pub fn find(name: &str) -> Option<&'static JobSpec> {
    JOBS.iter().find(|job| job.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_is_consistent() {
        for job in JOBS {
            assert!(!job.schedule.is_empty());
            assert!(job.timeout.as_secs() > 0);
        }
        assert!(find("active_crawl").is_some());
        assert!(find("unknown").is_none());
    }

    #[test]
    fn crawl_jobs_use_crawl_timeout() {
        let crawl = find("active_crawl").unwrap();
        assert_eq!(crawl.timeout.as_secs(), 9000);
        let docs = find("documents").unwrap();
        assert_eq!(docs.timeout.as_secs(), 7200);
    }
}
