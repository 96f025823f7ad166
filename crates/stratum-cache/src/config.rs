//! Cache and resize-controller configuration.

use serde::{Deserialize, Serialize};
use stratum_error::{CacheError, Result};

/// Feedback policy configuration for automatic resizing.
///
/// At the end of every epoch (`epoch_length` accesses) the controller
/// computes the epoch hit rate and compares it against the two
/// thresholds. A low rate grows the budget by `increment` (a factor
/// `>= 1.0`, optionally capped at `max_increment` bytes per step) up to
/// `max_size`; a high rate shrinks it by `decrement` (a factor in
/// `(0, 1]`, optionally floored at `max_decrement` bytes per step) down
/// to `min_size`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResizeConfig {
    /// Allow automatic growth.
    pub incr_enabled: bool,
    /// Allow automatic shrinking.
    pub decr_enabled: bool,
    /// Accesses per evaluation epoch.
    pub epoch_length: u64,
    /// Grow when the epoch hit rate falls below this.
    pub lower_hit_rate_threshold: f64,
    /// Multiplicative growth factor, `>= 1.0`.
    pub increment: f64,
    /// Cap on bytes added per growth step.
    pub max_increment: Option<u64>,
    /// Shrink when the epoch hit rate rises above this.
    pub upper_hit_rate_threshold: f64,
    /// Multiplicative shrink factor, in `(0, 1]`.
    pub decrement: f64,
    /// Cap on bytes removed per shrink step.
    pub max_decrement: Option<u64>,
    /// Hard lower bound on the budget.
    pub min_size: u64,
    /// Hard upper bound on the budget.
    pub max_size: u64,
}

impl Default for ResizeConfig {
    fn default() -> Self {
        Self {
            incr_enabled: true,
            decr_enabled: true,
            epoch_length: 50_000,
            lower_hit_rate_threshold: 0.9,
            increment: 2.0,
            max_increment: Some(4 * 1024 * 1024),
            upper_hit_rate_threshold: 0.999,
            decrement: 0.9,
            max_decrement: Some(1024 * 1024),
            min_size: 1024 * 1024,
            max_size: 32 * 1024 * 1024,
        }
    }
}

impl ResizeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.epoch_length == 0 {
            return Err(CacheError::BadArgument("epoch_length must be > 0".into()));
        }
        for (name, value) in [
            ("lower_hit_rate_threshold", self.lower_hit_rate_threshold),
            ("upper_hit_rate_threshold", self.upper_hit_rate_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(CacheError::BadArgument(format!(
                    "{name} must be in [0.0, 1.0], got {value}"
                )));
            }
        }
        if self.lower_hit_rate_threshold > self.upper_hit_rate_threshold {
            return Err(CacheError::BadArgument(
                "lower_hit_rate_threshold must not exceed upper_hit_rate_threshold".into(),
            ));
        }
        if self.increment < 1.0 {
            return Err(CacheError::BadArgument(format!(
                "increment must be >= 1.0, got {}",
                self.increment
            )));
        }
        if !(self.decrement > 0.0 && self.decrement <= 1.0) {
            return Err(CacheError::BadArgument(format!(
                "decrement must be in (0.0, 1.0], got {}",
                self.decrement
            )));
        }
        if self.min_size == 0 || self.min_size > self.max_size {
            return Err(CacheError::BadArgument(format!(
                "size bounds invalid: min_size={} max_size={}",
                self.min_size, self.max_size
            )));
        }
        Ok(())
    }
}

/// Top-level cache configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Initial memory budget in bytes.
    pub max_size: u64,
    /// Fraction of the budget the engine tries to keep clean; exposed
    /// as `min_clean_size` to flush heuristics layered above.
    pub min_clean_fraction: f64,
    /// Initial eviction switch. When off, eviction is suppressed
    /// entirely; resize accounting still proceeds.
    pub evictions_enabled: bool,
    /// Automatic resize policy.
    pub resize: ResizeConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 4 * 1024 * 1024,
            min_clean_fraction: 0.5,
            evictions_enabled: true,
            resize: ResizeConfig::default(),
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(CacheError::BadArgument("max_size must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.min_clean_fraction) {
            return Err(CacheError::BadArgument(format!(
                "min_clean_fraction must be in [0.0, 1.0], got {}",
                self.min_clean_fraction
            )));
        }
        self.resize.validate()?;
        if self.max_size < self.resize.min_size || self.max_size > self.resize.max_size {
            return Err(CacheError::BadArgument(format!(
                "max_size {} outside resize bounds [{}, {}]",
                self.max_size, self.resize.min_size, self.resize.max_size
            )));
        }
        Ok(())
    }
}
