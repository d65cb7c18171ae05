use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Queue server addresses (host:port)
    pub servers: Vec<String>,

    /// Topic to watch; reservations only return its jobs
    pub topic: Option<String>,

    /// How long one reservation attempt blocks. Short, so the loop observes
    /// the stop flag promptly.
    pub reserve_timeout_secs: u64,

    /// How long to sleep after a connect/reserve failure
    pub error_backoff_secs: u64,

    /// Failed jobs at least this old are deleted instead of decayed
    pub max_failed_job_age_secs: u64,

    /// A reservation faster than this marks its connection as preferred
    pub brief_reserve_ms: u64,

    /// Detach into the background at startup
    pub daemonize: bool,

    /// Where the launcher records the daemon pid
    pub pidfile: Option<PathBuf>,

    /// Symlink to watch for redeploys; when it moves, the worker drains and
    /// re-execs from the new target
    pub check_symlink: Option<PathBuf>,

    /// Append logs here instead of stdout (the usual choice when daemonized,
    /// since stdout goes to the null device)
    pub log_file: Option<PathBuf>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            servers: Vec::new(),
            topic: None,
            reserve_timeout_secs: 1,
            error_backoff_secs: 60,
            max_failed_job_age_secs: 60,
            brief_reserve_ms: 100,
            daemonize: false,
            pidfile: None,
            check_symlink: None,
            log_file: None,
        }
    }
}

impl WorkerConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: WorkerConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    pub fn reserve_timeout(&self) -> Duration {
        Duration::from_secs(self.reserve_timeout_secs)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }

    pub fn max_failed_job_age(&self) -> Duration {
        Duration::from_secs(self.max_failed_job_age_secs)
    }

    pub fn brief_reserve(&self) -> Duration {
        Duration::from_millis(self.brief_reserve_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_the_loop_constants() {
        let config = WorkerConfig::default();
        assert_eq!(config.reserve_timeout(), Duration::from_secs(1));
        assert_eq!(config.error_backoff(), Duration::from_secs(60));
        assert_eq!(config.max_failed_job_age(), Duration::from_secs(60));
        assert_eq!(config.brief_reserve(), Duration::from_millis(100));
        assert!(!config.daemonize);
        assert!(config.servers.is_empty());
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "servers:\n  - 127.0.0.1:11300\ntopic: jobs\nerror_backoff_secs: 5"
        )
        .unwrap();

        let config = WorkerConfig::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.servers, vec!["127.0.0.1:11300".to_string()]);
        assert_eq!(config.topic.as_deref(), Some("jobs"));
        assert_eq!(config.error_backoff_secs, 5);
        // Untouched fields keep their defaults
        assert_eq!(config.reserve_timeout_secs, 1);
    }
}
