// Copyright 2025 Tabletrack Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! Tracker configuration.
//!
//! [`ReconnectPolicy`] governs how a watcher re-establishes its notification
//! channel; [`TrackerConfig`] bundles it with the shutdown grace period, the
//! handler dispatch mode and the fault stream capacity. Both are built through
//! validating builders.
//!
//! ```rust
//! use std::time::Duration;
//! use tabletrack_core::config::{DispatchMode, ReconnectPolicy, TrackerConfig};
//!
//! let config = TrackerConfig::builder()
//!     .reconnect(
//!         ReconnectPolicy::builder()
//!             .initial_backoff_ms(50)
//!             .max_attempts(10)
//!             .build()
//!             .unwrap(),
//!     )
//!     .shutdown_grace_period(Duration::from_secs(2))
//!     .dispatch(DispatchMode::Queued { capacity: 128 })
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(config.reconnect.max_attempts, 10);
//! ```

use std::time::Duration;
use thiserror::Error;

/// Invalid configuration value.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Configuration error: {0}")]
pub struct ConfigError(pub String);

/// Exponential backoff policy for channel (re)connection.
///
/// The delay before attempt `n` (1-based) is
/// `initial_backoff_ms * multiplier^(n-1)`, capped at `max_backoff_ms`, with
/// `±(delay * backoff_jitter / 2)` random jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry, in milliseconds
    pub initial_backoff_ms: u64,

    /// Growth factor between consecutive delays
    pub multiplier: f64,

    /// Upper bound for a single delay, in milliseconds
    pub max_backoff_ms: u64,

    /// `open()` attempts per connect cycle before giving up (0 = unbounded)
    pub max_attempts: u32,

    /// Jitter factor (0.0 to 1.0)
    pub backoff_jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 100,
            multiplier: 2.0,
            max_backoff_ms: 30_000,
            max_attempts: 5,
            backoff_jitter: 0.1,
        }
    }
}

impl ReconnectPolicy {
    #[must_use]
    pub fn builder() -> ReconnectPolicyBuilder {
        ReconnectPolicyBuilder::default()
    }

    /// Validates the policy.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if:
    /// - `initial_backoff_ms` is 0
    /// - `initial_backoff_ms` > `max_backoff_ms`
    /// - `multiplier` is below 1.0 or not finite
    /// - `backoff_jitter` is not in range [0.0, 1.0]
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_backoff_ms == 0 {
            return Err(ConfigError(
                "initial_backoff_ms must be greater than 0".to_string(),
            ));
        }

        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(ConfigError(format!(
                "initial_backoff_ms ({}) must be <= max_backoff_ms ({})",
                self.initial_backoff_ms, self.max_backoff_ms
            )));
        }

        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError(format!(
                "multiplier ({}) must be a finite value >= 1.0",
                self.multiplier
            )));
        }

        if !(0.0..=1.0).contains(&self.backoff_jitter) {
            return Err(ConfigError(format!(
                "backoff_jitter ({}) must be between 0.0 and 1.0",
                self.backoff_jitter
            )));
        }

        Ok(())
    }

    /// Returns true if `attempts` open calls exhaust the policy.
    #[must_use]
    pub const fn is_exhausted(&self, attempts: u32) -> bool {
        self.max_attempts != 0 && attempts >= self.max_attempts
    }

    /// Base delay (without jitter) before attempt `attempt` (1-based).
    #[must_use]
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let scaled = (self.initial_backoff_ms as f64) * self.multiplier.powi(exponent);
        let capped = scaled.min(self.max_backoff_ms as f64);
        Duration::from_millis(capped as u64)
    }

    /// Delay before attempt `attempt` (1-based), jitter applied.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.base_backoff(attempt);
        if self.backoff_jitter > 0.0 {
            let base_ms = base.as_millis() as f64;
            let jitter_range = base_ms * self.backoff_jitter;
            let jitter = (rand::random::<f64>() * jitter_range) - (jitter_range / 2.0);
            Duration::from_millis((base_ms + jitter).max(0.0) as u64)
        } else {
            base
        }
    }
}

/// Builder for [`ReconnectPolicy`].
#[derive(Debug, Default)]
pub struct ReconnectPolicyBuilder {
    initial_backoff_ms: Option<u64>,
    multiplier: Option<f64>,
    max_backoff_ms: Option<u64>,
    max_attempts: Option<u32>,
    backoff_jitter: Option<f64>,
}

impl ReconnectPolicyBuilder {
    /// Default: 100ms
    #[must_use]
    pub fn initial_backoff_ms(mut self, ms: u64) -> Self {
        self.initial_backoff_ms = Some(ms);
        self
    }

    /// Default: 2.0
    #[must_use]
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    /// Default: 30,000ms (30 seconds)
    #[must_use]
    pub fn max_backoff_ms(mut self, ms: u64) -> Self {
        self.max_backoff_ms = Some(ms);
        self
    }

    /// Sets the number of `open()` attempts per connect cycle.
    ///
    /// Set to 0 for unbounded retries. Default: 5
    #[must_use]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Default: 0.1
    #[must_use]
    pub fn backoff_jitter(mut self, jitter: f64) -> Self {
        self.backoff_jitter = Some(jitter);
        self
    }

    /// Builds the policy.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if validation fails.
    pub fn build(self) -> Result<ReconnectPolicy, ConfigError> {
        let defaults = ReconnectPolicy::default();
        let policy = ReconnectPolicy {
            initial_backoff_ms: self.initial_backoff_ms.unwrap_or(defaults.initial_backoff_ms),
            multiplier: self.multiplier.unwrap_or(defaults.multiplier),
            max_backoff_ms: self.max_backoff_ms.unwrap_or(defaults.max_backoff_ms),
            max_attempts: self.max_attempts.unwrap_or(defaults.max_attempts),
            backoff_jitter: self.backoff_jitter.unwrap_or(defaults.backoff_jitter),
        };

        policy.validate()?;
        Ok(policy)
    }
}

/// How a watcher runs its handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// Handlers run on the watcher task between channel reads.
    #[default]
    Inline,

    /// Handlers run on a dedicated per-watcher worker fed by a bounded queue.
    ///
    /// Per-source FIFO order is preserved. When the queue is full the watcher
    /// stops reading from its channel until the worker catches up.
    Queued {
        /// Queue capacity (events)
        capacity: usize,
    },
}

/// Configuration shared by all watchers of a registry.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerConfig {
    /// Reconnect policy applied to every watcher
    pub reconnect: ReconnectPolicy,

    /// How long `stop()` waits for a watcher task before aborting it
    pub shutdown_grace_period: Duration,

    /// Handler dispatch mode
    pub dispatch: DispatchMode,

    /// Buffer size of the registry-wide fault broadcast
    pub fault_channel_capacity: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            shutdown_grace_period: Duration::from_secs(5),
            dispatch: DispatchMode::Inline,
            fault_channel_capacity: 256,
        }
    }
}

impl TrackerConfig {
    #[must_use]
    pub fn builder() -> TrackerConfigBuilder {
        TrackerConfigBuilder::default()
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the reconnect policy is invalid, the grace
    /// period is zero, or a capacity is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.reconnect.validate()?;

        if self.shutdown_grace_period.is_zero() {
            return Err(ConfigError(
                "shutdown_grace_period must be greater than 0".to_string(),
            ));
        }

        if let DispatchMode::Queued { capacity: 0 } = self.dispatch {
            return Err(ConfigError(
                "queued dispatch capacity must be greater than 0".to_string(),
            ));
        }

        if self.fault_channel_capacity == 0 {
            return Err(ConfigError(
                "fault_channel_capacity must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Builder for [`TrackerConfig`].
#[derive(Debug, Default)]
pub struct TrackerConfigBuilder {
    reconnect: Option<ReconnectPolicy>,
    shutdown_grace_period: Option<Duration>,
    dispatch: Option<DispatchMode>,
    fault_channel_capacity: Option<usize>,
}

impl TrackerConfigBuilder {
    #[must_use]
    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = Some(policy);
        self
    }

    /// Default: 5 seconds
    #[must_use]
    pub fn shutdown_grace_period(mut self, period: Duration) -> Self {
        self.shutdown_grace_period = Some(period);
        self
    }

    /// Default: [`DispatchMode::Inline`]
    #[must_use]
    pub fn dispatch(mut self, mode: DispatchMode) -> Self {
        self.dispatch = Some(mode);
        self
    }

    /// Default: 256
    #[must_use]
    pub fn fault_channel_capacity(mut self, capacity: usize) -> Self {
        self.fault_channel_capacity = Some(capacity);
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if validation fails.
    pub fn build(self) -> Result<TrackerConfig, ConfigError> {
        let defaults = TrackerConfig::default();
        let config = TrackerConfig {
            reconnect: self.reconnect.unwrap_or(defaults.reconnect),
            shutdown_grace_period: self
                .shutdown_grace_period
                .unwrap_or(defaults.shutdown_grace_period),
            dispatch: self.dispatch.unwrap_or(defaults.dispatch),
            fault_channel_capacity: self
                .fault_channel_capacity
                .unwrap_or(defaults.fault_channel_capacity),
        };

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.initial_backoff_ms, 100);
        assert_eq!(policy.max_backoff_ms, 30_000);
        assert_eq!(policy.max_attempts, 5);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_backoff_growth_and_cap() {
        let policy = ReconnectPolicy::builder()
            .initial_backoff_ms(100)
            .max_backoff_ms(1_000)
            .backoff_jitter(0.0)
            .build()
            .unwrap();

        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(5), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(64), Duration::from_millis(1_000));
    }

    #[test]
    fn test_backoff_jitter_range() {
        let policy = ReconnectPolicy::builder()
            .initial_backoff_ms(1_000)
            .backoff_jitter(0.2)
            .build()
            .unwrap();

        for _ in 0..100 {
            let delay = policy.backoff(1).as_millis();
            assert!((900..=1_100).contains(&delay), "delay {delay} out of range");
        }
    }

    #[test]
    fn test_exhaustion() {
        let capped = ReconnectPolicy {
            max_attempts: 3,
            ..ReconnectPolicy::default()
        };
        assert!(!capped.is_exhausted(2));
        assert!(capped.is_exhausted(3));

        let unbounded = ReconnectPolicy {
            max_attempts: 0,
            ..ReconnectPolicy::default()
        };
        assert!(!unbounded.is_exhausted(u32::MAX));
    }

    #[test]
    fn test_policy_validation() {
        assert!(ReconnectPolicy::builder().initial_backoff_ms(0).build().is_err());
        assert!(ReconnectPolicy::builder()
            .initial_backoff_ms(5_000)
            .max_backoff_ms(1_000)
            .build()
            .is_err());
        assert!(ReconnectPolicy::builder().multiplier(0.5).build().is_err());
        assert!(ReconnectPolicy::builder().backoff_jitter(1.5).build().is_err());
    }

    #[test]
    fn test_tracker_config_validation() {
        let config = TrackerConfig::builder().build().unwrap();
        assert_eq!(config.shutdown_grace_period, Duration::from_secs(5));
        assert_eq!(config.dispatch, DispatchMode::Inline);
        assert_eq!(config.fault_channel_capacity, 256);

        assert!(TrackerConfig::builder()
            .dispatch(DispatchMode::Queued { capacity: 0 })
            .build()
            .is_err());
        assert!(TrackerConfig::builder()
            .shutdown_grace_period(Duration::ZERO)
            .build()
            .is_err());
        assert!(TrackerConfig::builder()
            .fault_channel_capacity(0)
            .build()
            .is_err());
    }
}
