use clap::{Parser, Subcommand};
use std::time::Duration;

use crate::db::models::Scope;
use crate::sync::{PollerConfig, SyncSettings};

/// Snapshot sync and caching engine for a season-long fantasy golf league
#[derive(Parser, Debug, Clone)]
#[command(name = "fairway-sync", version, about)]
pub struct Config {
    /// League data service base URL
    #[arg(long, env = "FAIRWAY_REMOTE_URL", default_value = "http://localhost:8787/api")]
    pub remote_url: String,

    /// Bearer token sent to the data service
    #[arg(long, env = "FAIRWAY_API_TOKEN")]
    pub api_token: Option<String>,

    /// User to sign in as at startup
    #[arg(long, env = "FAIRWAY_USER_ID")]
    pub user_id: Option<String>,

    /// SQLite database path for the persisted snapshot
    #[arg(long, env = "FAIRWAY_DATABASE_PATH", default_value = "fairway.db")]
    pub database_path: String,

    /// Keep the snapshot in memory only
    #[arg(long, env = "FAIRWAY_NO_PERSIST", default_value = "false")]
    pub no_persist: bool,

    /// Status API listen address
    #[arg(long, env = "FAIRWAY_STATUS_ADDR", default_value = "127.0.0.1:8080")]
    pub status_addr: String,

    /// Leaderboard polling interval in seconds
    #[arg(long, env = "FAIRWAY_POLL_INTERVAL_SECS", default_value = "180")]
    pub poll_interval_secs: u64,

    /// Lifecycle / transition check interval in seconds
    #[arg(long, env = "FAIRWAY_TRANSITION_INTERVAL_SECS", default_value = "300")]
    pub transition_interval_secs: u64,

    /// Invalidation marker check interval in seconds
    #[arg(long, env = "FAIRWAY_INVALIDATION_INTERVAL_SECS", default_value = "600")]
    pub invalidation_interval_secs: u64,

    /// How long fetched invalidation markers are trusted, in seconds
    #[arg(long, env = "FAIRWAY_MARKER_TTL_SECS", default_value = "30")]
    pub marker_ttl_secs: u64,

    /// Consecutive leaderboard failures before polling gives up
    #[arg(long, env = "FAIRWAY_MAX_RETRIES", default_value = "3")]
    pub max_retries: u32,

    /// Multiplier applied to the poll interval per failure
    #[arg(long, env = "FAIRWAY_BACKOFF_FACTOR", default_value = "2.0")]
    pub backoff_factor: f64,

    /// Largest exponent the backoff factor is raised to
    #[arg(long, env = "FAIRWAY_MAX_BACKOFF_EXPONENT", default_value = "4")]
    pub max_backoff_exponent: u32,

    /// Upper bound on any backoff delay, in seconds
    #[arg(long, env = "FAIRWAY_MAX_BACKOFF_SECS", default_value = "1800")]
    pub max_backoff_secs: u64,

    /// Random spread applied to backoff delays (0.0–1.0)
    #[arg(long, env = "FAIRWAY_BACKOFF_JITTER", default_value = "0.1")]
    pub backoff_jitter: f64,

    /// HTTP request timeout in seconds
    #[arg(long, env = "FAIRWAY_REQUEST_TIMEOUT_SECS", default_value = "15")]
    pub request_timeout_secs: u64,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Post an invalidation marker and exit
    Invalidate {
        /// tournaments, rosters or global
        #[arg(long)]
        scope: Scope,

        /// Who is invalidating, recorded on the marker
        #[arg(long, default_value = "fairway-sync")]
        source: String,
    },
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.poll_interval_secs == 0 {
            anyhow::bail!("poll_interval_secs must be positive");
        }
        if self.transition_interval_secs == 0 {
            anyhow::bail!("transition_interval_secs must be positive");
        }
        if self.invalidation_interval_secs == 0 {
            anyhow::bail!("invalidation_interval_secs must be positive");
        }
        if self.max_retries == 0 {
            anyhow::bail!("max_retries must be at least 1");
        }
        if !(1.0..=10.0).contains(&self.backoff_factor) {
            anyhow::bail!("backoff_factor must be between 1.0 and 10.0");
        }
        if !(0.0..=1.0).contains(&self.backoff_jitter) {
            anyhow::bail!("backoff_jitter must be between 0.0 and 1.0");
        }
        if self.max_backoff_secs < self.poll_interval_secs {
            anyhow::bail!("max_backoff_secs must be at least poll_interval_secs");
        }
        if self.request_timeout_secs == 0 {
            anyhow::bail!("request_timeout_secs must be positive");
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            transition_interval: Duration::from_secs(self.transition_interval_secs),
            invalidation_interval: Duration::from_secs(self.invalidation_interval_secs),
            marker_ttl: Duration::from_secs(self.marker_ttl_secs),
            poller: PollerConfig {
                interval: Duration::from_secs(self.poll_interval_secs),
                backoff_factor: self.backoff_factor,
                max_backoff_exponent: self.max_backoff_exponent,
                max_delay: Duration::from_secs(self.max_backoff_secs),
                max_retries: self.max_retries,
                jitter: self.backoff_jitter,
            },
        }
    }
}
