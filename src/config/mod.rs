use crate::errors::{AppError, AppResult};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Application-wide defaults. Everything can be overridden by env vars
/// (`RETROMAIL_*`, usually via `.env`) but nothing requires a config file.
#[derive(Debug, Clone)]
pub struct AppDefaults {
    pub data_dir: PathBuf,
    pub imap_host: String,
    pub imap_port: u16,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub sync: SyncSettings,
    pub idle: IdleSettings,
}

/// Knobs for the Inbox synchronizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    /// Max UIDs requested per fetch.
    pub batch_size: u32,
    /// Max messages held in memory.
    pub cache_bound: usize,
    /// Messages written to the on-disk cache when backgrounding.
    pub persist_count: usize,
    /// UIDs requested by "load more".
    pub older_batch: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            batch_size: 50,
            cache_bound: 200,
            persist_count: 50,
            older_batch: 25,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleSettings {
    /// IDLE is re-issued after this long even if the server stays silent.
    pub keepalive: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Consecutive failed reconnects before the watcher gives up.
    pub max_attempts: u32,
}

impl Default for IdleSettings {
    fn default() -> Self {
        Self {
            keepalive: Duration::from_secs(20 * 60),
            backoff_base: Duration::from_secs(2),
            backoff_max: Duration::from_secs(5 * 60),
            max_attempts: 10,
        }
    }
}

impl AppDefaults {
    pub fn load() -> AppResult<Self> {
        let data_dir = match env::var("RETROMAIL_DATA_DIR") {
            Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
            _ => default_data_dir()?,
        };

        let sync_defaults = SyncSettings::default();
        let sync = SyncSettings {
            batch_size: env_or("RETROMAIL_BATCH_SIZE", sync_defaults.batch_size).max(1),
            cache_bound: env_or("RETROMAIL_CACHE_BOUND", sync_defaults.cache_bound).max(1),
            persist_count: env_or("RETROMAIL_PERSIST_COUNT", sync_defaults.persist_count),
            older_batch: env_or("RETROMAIL_OLDER_BATCH", sync_defaults.older_batch).max(1),
        };

        let idle_defaults = IdleSettings::default();
        let idle = IdleSettings {
            keepalive: Duration::from_secs(
                env_or(
                    "RETROMAIL_IDLE_KEEPALIVE_MINUTES",
                    idle_defaults.keepalive.as_secs() / 60,
                )
                .max(1)
                    * 60,
            ),
            backoff_base: Duration::from_secs(env_or(
                "RETROMAIL_BACKOFF_BASE_SECS",
                idle_defaults.backoff_base.as_secs(),
            )),
            backoff_max: Duration::from_secs(env_or(
                "RETROMAIL_BACKOFF_MAX_SECS",
                idle_defaults.backoff_max.as_secs(),
            )),
            max_attempts: env_or("RETROMAIL_RECONNECT_ATTEMPTS", idle_defaults.max_attempts),
        };

        Ok(Self {
            data_dir,
            imap_host: env::var("RETROMAIL_IMAP_HOST").unwrap_or_else(|_| "imap.gmail.com".into()),
            imap_port: env_or("RETROMAIL_IMAP_PORT", 993),
            smtp_host: env::var("RETROMAIL_SMTP_HOST").unwrap_or_else(|_| "smtp.gmail.com".into()),
            smtp_port: env_or("RETROMAIL_SMTP_PORT", 465),
            sync,
            idle,
        })
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("retromail.db")
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn default_data_dir() -> AppResult<PathBuf> {
    dirs::data_dir()
        .or_else(dirs::home_dir)
        .map(|base| base.join("retromail"))
        .ok_or_else(|| AppError::Config("could not determine a data directory".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_stock_mail_app() {
        let sync = SyncSettings::default();
        assert_eq!(sync.batch_size, 50);
        assert_eq!(sync.cache_bound, 200);
        assert_eq!(sync.persist_count, 50);
        assert_eq!(sync.older_batch, 25);

        let idle = IdleSettings::default();
        assert!(idle.backoff_base < idle.backoff_max);
        assert!(idle.max_attempts > 0);
    }

    #[test]
    fn env_or_ignores_garbage() {
        assert_eq!(env_or("RETROMAIL_TEST_UNSET_KEY", 7u32), 7);
    }
}
