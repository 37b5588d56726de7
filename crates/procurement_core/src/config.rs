use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;

/// Process-wide configuration, read once at startup and threaded through
/// the call graph. Nothing else touches the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub nabavki_username: Option<String>,
    pub nabavki_password: Option<String>,
    /// Absent key disables product-item extraction; the core still runs.
    pub openai_api_key: Option<String>,
    pub file_store_root: PathBuf,
    pub health_dir: PathBuf,
    pub log_dir: Option<PathBuf>,
    pub crawl_concurrency: usize,
    pub doc_workers: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let database_url =
            env::var("DATABASE_URL").context("DATABASE_URL environment variable not set")?;

        let crawl_concurrency = env::var("CRAWL_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(3)
            .clamp(1, 4);

        let doc_workers = env::var("DOC_WORKERS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(2)
            .max(1);

        Ok(Config {
            database_url,
            nabavki_username: env::var("NABAVKI_USERNAME").ok(),
            nabavki_password: env::var("NABAVKI_PASSWORD").ok(),
            openai_api_key: env::var("OPENAI_API_KEY").ok(),
            file_store_root: env::var("FILE_STORE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./downloads/files")),
            health_dir: env::var("HEALTH_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/tmp")),
            log_dir: env::var("LOG_DIR").ok().map(PathBuf::from),
            crawl_concurrency,
            doc_workers,
        })
    }

    pub fn nabavki_credentials(&self) -> Option<(String, String)> {
        match (&self.nabavki_username, &self.nabavki_password) {
            (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
            _ => None,
        }
    }

    /// Local path for a downloaded document, partitioned per tender so
    /// workers never write into each other's directories.
    pub fn document_path(&self, tender_key: &str, doc_id: i64, ext: &str) -> PathBuf {
        let safe_key = tender_key.replace('/', "_");
        self.file_store_root
            .join(safe_key)
            .join(format!("{}.{}", doc_id, ext))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_path_is_partitioned_per_tender() {
        let config = Config {
            database_url: "postgres://localhost/test".to_string(),
            nabavki_username: None,
            nabavki_password: None,
            openai_api_key: None,
            file_store_root: PathBuf::from("/data/files"),
            health_dir: PathBuf::from("/tmp"),
            log_dir: None,
            crawl_concurrency: 3,
            doc_workers: 2,
        };
        let path = config.document_path("05231/2024", 17, "pdf");
        assert_eq!(path, PathBuf::from("/data/files/05231_2024/17.pdf"));
    }
}
