//! Typed configuration from environment variables.
//!
//! Every knob has a default; set variables override it. Malformed values
//! fail fast at load instead of surfacing mid-run.

use std::time::Duration;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// Global enable flag. When false, `JobRuntime::start` is a no-op.
    pub enabled: bool,
    /// Default worker-pool bound per queue.
    pub workers: usize,
    /// Stalled-job grace period, doubling as the sweep interval.
    pub stall_grace: Duration,
    /// Prefetch batch size per queue.
    pub prefetch: usize,
    /// Scheduler idle wait bound.
    pub idle_wait: Duration,
    /// Drain bound for the first shutdown phase.
    pub shutdown_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            workers: 4,
            stall_grace: Duration::from_secs(600),
            prefetch: 100,
            idle_wait: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Load configuration from `JOBS_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            enabled: parse_var("JOBS_ENABLED", defaults.enabled)?,
            workers: parse_var("JOBS_WORKERS", defaults.workers)?,
            stall_grace: secs_var("JOBS_STALL_GRACE_SECS", defaults.stall_grace)?,
            prefetch: parse_var("JOBS_PREFETCH", defaults.prefetch)?,
            idle_wait: secs_var("JOBS_IDLE_WAIT_SECS", defaults.idle_wait)?,
            shutdown_grace: secs_var("JOBS_SHUTDOWN_GRACE_SECS", defaults.shutdown_grace)?,
        })
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| Error::Config(format!("invalid value for {name}: {raw}"))),
        Err(_) => Ok(default),
    }
}

fn secs_var(name: &str, default: Duration) -> Result<Duration> {
    match std::env::var(name) {
        Ok(raw) => {
            let secs: u64 = raw
                .parse()
                .map_err(|_| Error::Config(format!("invalid value for {name}: {raw}")))?;
            Ok(Duration::from_secs(secs))
        }
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_env() {
        let config = Config::default();
        assert!(config.enabled);
        assert_eq!(config.workers, 4);
        assert_eq!(config.stall_grace, Duration::from_secs(600));
        assert_eq!(config.prefetch, 100);
    }
}
