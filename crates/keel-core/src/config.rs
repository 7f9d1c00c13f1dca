//! Engine configuration, read from the environment.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::snapshot::DEFAULT_SNAPSHOT_EVERY;

/// Default bound on save attempts when a command hits conflicts.
pub const DEFAULT_MAX_SAVE_ATTEMPTS: u32 = 3;

/// Tunables for the aggregate repository, outbox relay and projections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Events between automatic snapshots; 0 disables them.
    pub snapshot_every: u64,
    /// Save attempts before a command reports a conflict.
    pub max_save_attempts: u32,
    /// Outbox relay settings.
    pub relay: RelayConfig,
    /// Projection engine settings.
    pub projection: ProjectionConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            snapshot_every: DEFAULT_SNAPSHOT_EVERY,
            max_save_attempts: DEFAULT_MAX_SAVE_ATTEMPTS,
            relay: RelayConfig::default(),
            projection: ProjectionConfig::default(),
        }
    }
}

/// Outbox relay settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Records fetched per tick.
    pub batch_size: usize,
    /// Sleep between ticks.
    pub poll_interval: Duration,
    /// Failed attempts before a record is dead-lettered.
    pub max_attempts: u32,
    /// First backoff delay.
    pub backoff_min: Duration,
    /// Backoff ceiling.
    pub backoff_max: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_millis(200),
            max_attempts: 10,
            backoff_min: Duration::from_millis(100),
            backoff_max: Duration::from_secs(30),
        }
    }
}

/// Projection engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectionConfig {
    /// Events processed per batch.
    pub batch_size: usize,
    /// Sleep between polls when caught up.
    pub poll_interval: Duration,
    /// Consecutive handler failures before an event is dead-lettered.
    pub max_handler_attempts: u32,
    /// Retry a failing event forever instead of dead-lettering it.
    pub block_on_failure: bool,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_millis(200),
            max_handler_attempts: 3,
            block_on_failure: false,
        }
    }
}

impl EngineConfig {
    /// Builds a configuration from `KEEL_*` environment variables, falling
    /// back to defaults for unset ones.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` naming the variable that failed to parse.
    pub fn from_env() -> Result<Self, DomainError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` naming the key that failed to parse.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, DomainError> {
        let defaults = Self::default();
        Ok(Self {
            snapshot_every: parse_or(&lookup, "KEEL_SNAPSHOT_EVERY", defaults.snapshot_every)?,
            max_save_attempts: parse_or(
                &lookup,
                "KEEL_MAX_SAVE_ATTEMPTS",
                defaults.max_save_attempts,
            )?,
            relay: RelayConfig {
                batch_size: parse_or(&lookup, "KEEL_RELAY_BATCH_SIZE", defaults.relay.batch_size)?,
                poll_interval: millis_or(
                    &lookup,
                    "KEEL_RELAY_POLL_INTERVAL_MS",
                    defaults.relay.poll_interval,
                )?,
                max_attempts: parse_or(
                    &lookup,
                    "KEEL_RELAY_MAX_ATTEMPTS",
                    defaults.relay.max_attempts,
                )?,
                backoff_min: millis_or(
                    &lookup,
                    "KEEL_RELAY_BACKOFF_MIN_MS",
                    defaults.relay.backoff_min,
                )?,
                backoff_max: millis_or(
                    &lookup,
                    "KEEL_RELAY_BACKOFF_MAX_MS",
                    defaults.relay.backoff_max,
                )?,
            },
            projection: ProjectionConfig {
                batch_size: parse_or(
                    &lookup,
                    "KEEL_PROJECTION_BATCH_SIZE",
                    defaults.projection.batch_size,
                )?,
                poll_interval: millis_or(
                    &lookup,
                    "KEEL_PROJECTION_POLL_INTERVAL_MS",
                    defaults.projection.poll_interval,
                )?,
                max_handler_attempts: parse_or(
                    &lookup,
                    "KEEL_PROJECTION_MAX_ATTEMPTS",
                    defaults.projection.max_handler_attempts,
                )?,
                block_on_failure: parse_or(
                    &lookup,
                    "KEEL_PROJECTION_BLOCK_ON_FAILURE",
                    defaults.projection.block_on_failure,
                )?,
            },
        })
    }
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, DomainError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| DomainError::Validation(format!("{key} must be valid: {e}"))),
    }
}

fn millis_or(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration, DomainError> {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    parse_or(lookup, key, default_ms).map(Duration::from_millis)
}
