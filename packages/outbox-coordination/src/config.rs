//! Agent configuration.
//!
//! Timing and sharding settings are validated here, before any agent starts:
//! the protocol's guarantees rely on `polling <= pulse <= expiration / 3`.

use std::collections::BTreeSet;
use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::TimeDelta;
use dotenvy::dotenv;

use crate::agent::ShardAssignment;
use crate::error::ConfigError;

pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_PULSE_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_PULSE_EXPIRATION: Duration = Duration::from_secs(30);
pub const DEFAULT_BATCH_SIZE: i64 = 50;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(30);

// ============================================================================
// Pulse timing
// ============================================================================

/// Pulse cadence shared by every agent kind.
///
/// - `polling_interval`: delay before the next pulse while waiting on peers.
/// - `pulse_interval`: delay before the next pulse once stable (running or
///   suspended).
/// - `pulse_expiration`: how long an agent row stays valid without a pulse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PulseConfig {
    polling_interval: Duration,
    pulse_interval: Duration,
    pulse_expiration: Duration,
}

impl PulseConfig {
    pub fn new(
        polling_interval: Duration,
        pulse_interval: Duration,
        pulse_expiration: Duration,
    ) -> Result<Self, ConfigError> {
        let valid = polling_interval <= pulse_interval && pulse_interval <= pulse_expiration / 3;
        if !valid || polling_interval.is_zero() {
            return Err(ConfigError::InvalidIntervals {
                polling: polling_interval,
                pulse: pulse_interval,
                expiration: pulse_expiration,
            });
        }

        Ok(Self {
            polling_interval,
            pulse_interval,
            pulse_expiration,
        })
    }

    pub fn polling_interval(&self) -> Duration {
        self.polling_interval
    }

    pub fn pulse_interval(&self) -> Duration {
        self.pulse_interval
    }

    pub fn pulse_expiration(&self) -> Duration {
        self.pulse_expiration
    }

    pub(crate) fn polling_delta(&self) -> TimeDelta {
        to_delta(self.polling_interval)
    }

    pub(crate) fn pulse_delta(&self) -> TimeDelta {
        to_delta(self.pulse_interval)
    }

    pub(crate) fn expiration_delta(&self) -> TimeDelta {
        to_delta(self.pulse_expiration)
    }
}

impl Default for PulseConfig {
    fn default() -> Self {
        Self {
            polling_interval: DEFAULT_POLLING_INTERVAL,
            pulse_interval: DEFAULT_PULSE_INTERVAL,
            pulse_expiration: DEFAULT_PULSE_EXPIRATION,
        }
    }
}

pub(crate) fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

// ============================================================================
// Event processing
// ============================================================================

/// Settings for the work part of an event processor cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessingConfig {
    /// Maximum events fetched per cycle.
    pub batch_size: i64,
    /// Delay before a failed event becomes due again.
    pub retry_delay: Duration,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

// ============================================================================
// Sharding
// ============================================================================

/// How this process's event processors get their shards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardingConfig {
    /// One agent, shard derived from the roster.
    Dynamic,
    /// One agent per assigned shard, all sharing the same total.
    Static(Vec<ShardAssignment>),
}

impl ShardingConfig {
    /// Validates a static layout: at least one index, all below `total`, no
    /// duplicates, `total` within
    /// [`MAX_SHARD_TOTAL`](crate::agent::MAX_SHARD_TOTAL). Returns assignments in
    /// ascending index order.
    pub fn fixed(total: u32, assigned: &[u32]) -> Result<Self, ConfigError> {
        if assigned.is_empty() {
            return Err(ConfigError::InvalidStaticSharding(
                "at least one shard must be assigned".into(),
            ));
        }

        let mut seen = BTreeSet::new();
        for index in assigned {
            if !seen.insert(*index) {
                return Err(ConfigError::InvalidStaticSharding(format!(
                    "shard {} is assigned more than once",
                    index
                )));
            }
        }

        let assignments = seen
            .into_iter()
            .map(|index| ShardAssignment::new(total, index))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ShardingConfig::Static(assignments))
    }
}

// ============================================================================
// Environment
// ============================================================================

/// Process configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub agent_name: String,
    pub pulse: PulseConfig,
    pub processing: ProcessingConfig,
    pub sharding: ShardingConfig,
}

impl Config {
    /// Load configuration from environment variables (and `.env` if present).
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let database_url = lookup("DATABASE_URL").context("DATABASE_URL must be set")?;
        let agent_name = lookup("OUTBOX_AGENT_NAME").unwrap_or_else(|| "outbox-agent".to_string());

        let pulse = PulseConfig::new(
            millis(&lookup, "OUTBOX_POLLING_INTERVAL_MS", DEFAULT_POLLING_INTERVAL)?,
            millis(&lookup, "OUTBOX_PULSE_INTERVAL_MS", DEFAULT_PULSE_INTERVAL)?,
            millis(&lookup, "OUTBOX_PULSE_EXPIRATION_MS", DEFAULT_PULSE_EXPIRATION)?,
        )
        .context("invalid pulse configuration")?;

        let batch_size: i64 = parse(&lookup, "OUTBOX_BATCH_SIZE")?.unwrap_or(DEFAULT_BATCH_SIZE);
        if batch_size <= 0 {
            return Err(ConfigError::InvalidValue {
                key: "OUTBOX_BATCH_SIZE".into(),
                message: "must be positive".into(),
            }
            .into());
        }
        let retry_delay = parse::<u64>(&lookup, "OUTBOX_RETRY_DELAY_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_RETRY_DELAY);

        let total: Option<u32> = parse(&lookup, "OUTBOX_SHARDS_TOTAL_COUNT")?;
        let assigned = lookup("OUTBOX_SHARDS_ASSIGNED");
        let sharding = match (total, assigned) {
            (None, None) => ShardingConfig::Dynamic,
            (Some(total), Some(assigned)) => {
                let indices = parse_indices(&assigned)?;
                ShardingConfig::fixed(total, &indices).context("invalid static sharding")?
            }
            _ => {
                return Err(ConfigError::InvalidStaticSharding(
                    "OUTBOX_SHARDS_TOTAL_COUNT and OUTBOX_SHARDS_ASSIGNED must be set together"
                        .into(),
                )
                .into())
            }
        };

        Ok(Self {
            database_url,
            agent_name,
            pulse,
            processing: ProcessingConfig {
                batch_size,
                retry_delay,
            },
            sharding,
        })
    }
}

fn parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    lookup(key)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            })
        })
        .transpose()
}

fn millis(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    Ok(parse::<u64>(lookup, key)?
        .map(Duration::from_millis)
        .unwrap_or(default))
}

fn parse_indices(raw: &str) -> Result<Vec<u32>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<u32>().map_err(|e| ConfigError::InvalidValue {
                key: "OUTBOX_SHARDS_ASSIGNED".into(),
                message: format!("{:?}: {}", part, e),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn default_intervals_satisfy_the_ordering_rule() {
        let config = PulseConfig::default();
        assert!(PulseConfig::new(
            config.polling_interval(),
            config.pulse_interval(),
            config.pulse_expiration()
        )
        .is_ok());
    }

    #[test]
    fn pulse_interval_above_a_third_of_expiration_is_rejected() {
        let result = PulseConfig::new(
            Duration::from_millis(100),
            Duration::from_secs(11),
            Duration::from_secs(30),
        );
        assert!(matches!(result, Err(ConfigError::InvalidIntervals { .. })));
    }

    #[test]
    fn polling_above_pulse_interval_is_rejected() {
        let result = PulseConfig::new(
            Duration::from_secs(3),
            Duration::from_secs(2),
            Duration::from_secs(30),
        );
        assert!(result.is_err());
    }

    #[test]
    fn pulse_interval_of_exactly_a_third_is_accepted() {
        let result = PulseConfig::new(
            Duration::from_secs(1),
            Duration::from_secs(10),
            Duration::from_secs(30),
        );
        assert!(result.is_ok());
    }

    #[test]
    fn static_sharding_rejects_duplicates_and_out_of_range() {
        assert!(ShardingConfig::fixed(3, &[0, 0]).is_err());
        assert!(ShardingConfig::fixed(3, &[3]).is_err());
        assert!(ShardingConfig::fixed(3, &[]).is_err());
        assert!(matches!(
            ShardingConfig::fixed(u32::MAX, &[0]),
            Err(ConfigError::ShardTotalTooLarge { .. })
        ));
    }

    #[test]
    fn static_sharding_sorts_assignments() {
        let config = ShardingConfig::fixed(4, &[3, 1]).unwrap();
        let ShardingConfig::Static(assignments) = config else {
            panic!("expected static sharding");
        };
        let indices: Vec<u32> = assignments.iter().map(|a| a.index()).collect();
        assert_eq!(indices, vec![1, 3]);
    }

    #[test]
    fn from_lookup_uses_defaults() {
        let config = Config::from_lookup(lookup(&[("DATABASE_URL", "postgres://localhost/db")]))
            .unwrap();
        assert_eq!(config.agent_name, "outbox-agent");
        assert_eq!(config.pulse, PulseConfig::default());
        assert_eq!(config.processing, ProcessingConfig::default());
        assert_eq!(config.sharding, ShardingConfig::Dynamic);
    }

    #[test]
    fn from_lookup_reads_static_sharding() {
        let config = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/db"),
            ("OUTBOX_SHARDS_TOTAL_COUNT", "4"),
            ("OUTBOX_SHARDS_ASSIGNED", "0, 2"),
            ("OUTBOX_BATCH_SIZE", "10"),
        ]))
        .unwrap();
        assert_eq!(config.processing.batch_size, 10);
        assert_eq!(
            config.sharding,
            ShardingConfig::Static(vec![
                ShardAssignment::new(4, 0).unwrap(),
                ShardAssignment::new(4, 2).unwrap(),
            ])
        );
    }

    #[test]
    fn from_lookup_requires_both_shard_variables() {
        let result = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/db"),
            ("OUTBOX_SHARDS_TOTAL_COUNT", "4"),
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn from_lookup_requires_database_url() {
        assert!(Config::from_lookup(lookup(&[])).is_err());
    }

    #[test]
    fn from_lookup_rejects_garbage_numbers() {
        let result = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/db"),
            ("OUTBOX_PULSE_INTERVAL_MS", "soon"),
        ]));
        assert!(result.is_err());
    }
}
