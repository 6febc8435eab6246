//! Engine configuration.

use std::time::Duration;

/// Engine configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL; absent means the in-memory store.
    pub database_url: Option<String>,

    /// Default poll cadence for bindings that do not override it.
    pub poll_interval_ms: u64,

    /// Default concurrency used when creating bindings.
    pub max_concurrent: usize,

    /// Graceful shutdown deadline for in-flight runners.
    pub drain_timeout_ms: u64,

    /// Global default for definitions created without an explicit restart
    /// policy.
    pub restart_on_crash: bool,

    /// Truncation bound for payload messages.
    pub max_message_chars: usize,

    /// Bound on crash-restart chains.
    pub max_restart_chain: i32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            poll_interval_ms: 1000,
            max_concurrent: num_cpus::get().max(1),
            drain_timeout_ms: 30_000,
            restart_on_crash: false,
            max_message_chars: 1000,
            max_restart_chain: 1,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Config::default();

        let database_url = std::env::var("JOBMILL_DATABASE_URL").ok();

        let poll_interval_ms = env_parse("JOBMILL_POLL_INTERVAL_MS", defaults.poll_interval_ms);
        let max_concurrent = env_parse("JOBMILL_MAX_CONCURRENT", defaults.max_concurrent).max(1);
        let drain_timeout_ms = env_parse("JOBMILL_DRAIN_TIMEOUT_MS", defaults.drain_timeout_ms);
        let restart_on_crash = env_parse("JOBMILL_RESTART_ON_CRASH", defaults.restart_on_crash);
        let max_message_chars =
            env_parse("JOBMILL_MAX_MESSAGE_CHARS", defaults.max_message_chars).max(1);
        let max_restart_chain =
            env_parse("JOBMILL_MAX_RESTART_CHAIN", defaults.max_restart_chain).max(0);

        Ok(Config {
            database_url,
            poll_interval_ms,
            max_concurrent,
            drain_timeout_ms,
            restart_on_crash,
            max_message_chars,
            max_restart_chain,
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::Config;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.poll_interval_ms, 1000);
        assert_eq!(config.max_message_chars, 1000);
        assert_eq!(config.max_restart_chain, 1);
        assert!(config.max_concurrent >= 1);
        assert!(!config.restart_on_crash);
    }
}
