//! Resolver and process configuration.

use std::time::Duration;

/// How a resolver instance comes up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    /// No prior state: start serving immediately.
    Fresh,
    /// The server restarted mid-workflow: replay the persisted mappings
    /// before issuing any new lookups.
    Restart,
}

/// Knobs for one resolver instance.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Base delay before re-sending a lookup the service pushed back on.
    pub backpressure_base: Duration,
    /// Jitter factor in `[0, 1]`; the actual delay is drawn uniformly from
    /// `[base·(1−f), base·(1+f)]`.
    pub backpressure_jitter: f64,
    /// Deadline per outbound send. Coarse: it detects lost messages, it
    /// does not bound individual lookups tightly.
    pub request_timeout: Duration,
    pub start_mode: StartMode,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            backpressure_base: Duration::from_secs(10),
            backpressure_jitter: 0.5,
            request_timeout: Duration::from_secs(30),
            start_mode: StartMode::Fresh,
        }
    }
}

/// Process configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL for the digest store
    pub database_url: String,

    /// Per-workflow resolver settings
    pub resolver: ResolverConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

        let backpressure_base = env_millis("TAGPIN_BACKPRESSURE_BASE_MS", 10_000);

        let backpressure_jitter: f64 = std::env::var("TAGPIN_BACKPRESSURE_JITTER")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(0.5);
        if !(0.0..=1.0).contains(&backpressure_jitter) {
            anyhow::bail!("TAGPIN_BACKPRESSURE_JITTER must be within [0, 1]");
        }

        let request_timeout = env_millis("TAGPIN_REQUEST_TIMEOUT_MS", 30_000);

        Ok(Config {
            database_url,
            resolver: ResolverConfig {
                backpressure_base,
                backpressure_jitter,
                request_timeout,
                start_mode: StartMode::Fresh,
            },
        })
    }
}

fn env_millis(name: &str, default_ms: u64) -> Duration {
    let millis = std::env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default_ms);
    Duration::from_millis(millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolver_defaults_match_the_documented_knobs() {
        let config = ResolverConfig::default();
        assert_eq!(config.backpressure_base, Duration::from_secs(10));
        assert!((config.backpressure_jitter - 0.5).abs() < f64::EPSILON);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.start_mode, StartMode::Fresh);
    }
}
