//! Server configuration, read once at startup from the environment.

use std::path::PathBuf;
use std::time::Duration;

use crate::{Error, Result};

/// Percentage of failed tasks (out of all tasks of a job) at which the
/// whole job is considered failed.
pub const DEFAULT_TASK_FAIL_JOB_PERCENTAGE: f64 = 10.0;

/// Number of log lines kept on the task document itself.
pub const DEFAULT_LOG_TAIL_LINES: usize = 10;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// SQLite database URL.
    pub database_url: String,
    /// Directory where job archive ZIPs are stored.
    pub archive_storage_dir: PathBuf,
    /// Jobs stuck in `archiving` longer than this are re-submitted.
    pub archive_resume_age: Duration,
    /// Interval of the archival-resume sweep.
    pub archive_resume_interval: Duration,
    /// Interval of the job runnability sweep.
    pub runnability_check_interval: Duration,
    /// Failed-task percentage at which the whole job fails.
    pub task_fail_job_percentage: f64,
    /// Number of log lines kept on the task document itself.
    pub log_tail_lines: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:flamenco.db?mode=rwc".to_string(),
            archive_storage_dir: PathBuf::from("flamenco-archive"),
            archive_resume_age: Duration::from_secs(24 * 60 * 60),
            archive_resume_interval: Duration::from_secs(60 * 60),
            runnability_check_interval: Duration::from_secs(10 * 60),
            task_fail_job_percentage: DEFAULT_TASK_FAIL_JOB_PERCENTAGE,
            log_tail_lines: DEFAULT_LOG_TAIL_LINES,
        }
    }
}

impl ServerConfig {
    /// Load the configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database_url = url;
        }
        if let Ok(dir) = std::env::var("FLAMENCO_ARCHIVE_DIR") {
            config.archive_storage_dir = PathBuf::from(dir);
        }
        if let Ok(secs) = std::env::var("FLAMENCO_ARCHIVE_RESUME_AGE_SECS") {
            config.archive_resume_age = Duration::from_secs(parse_env("FLAMENCO_ARCHIVE_RESUME_AGE_SECS", &secs)?);
        }
        if let Ok(perc) = std::env::var("FLAMENCO_TASK_FAIL_JOB_PERCENTAGE") {
            let perc: f64 = parse_env("FLAMENCO_TASK_FAIL_JOB_PERCENTAGE", &perc)?;
            if !(0.0..=100.0).contains(&perc) {
                return Err(Error::config(format!(
                    "FLAMENCO_TASK_FAIL_JOB_PERCENTAGE must be in 0-100, got {perc}"
                )));
            }
            config.task_fail_job_percentage = perc;
        }
        if let Ok(lines) = std::env::var("FLAMENCO_LOG_TAIL_LINES") {
            config.log_tail_lines = parse_env("FLAMENCO_LOG_TAIL_LINES", &lines)?;
        }

        Ok(config)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::config(format!("invalid value {value:?} for {name}")))
}
