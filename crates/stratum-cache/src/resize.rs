//! Automatic resize controller: a feedback loop that grows the budget
//! when the hit rate is poor and shrinks it when the cache is clearly
//! oversized.
//!
//! Epoch counters are separate from the cumulative statistics, so a
//! statistics reset does not perturb resize decisions and vice versa.

use serde::Serialize;
use stratum_error::Result;
use tracing::debug;

use crate::client::MetadataStore;
use crate::state::CacheState;

/// Last decision the controller took.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ResizeMode {
    #[default]
    Steady,
    Growing,
    Shrinking,
}

#[derive(Debug, Default)]
pub(crate) struct ResizeState {
    pub(crate) mode: ResizeMode,
    pub(crate) epoch_accesses: u64,
    pub(crate) epoch_hits: u64,
    pub(crate) epochs_completed: u64,
}

impl ResizeState {
    pub(crate) fn epoch_hit_rate(&self) -> f64 {
        if self.epoch_accesses == 0 {
            0.0
        } else {
            self.epoch_hits as f64 / self.epoch_accesses as f64
        }
    }
}

impl CacheState {
    /// Evaluate one resize epoch. Runs automatically every
    /// `epoch_length` accesses and on the explicit trigger.
    pub(crate) fn run_resize_epoch(&mut self, store: &dyn MetadataStore) -> Result<()> {
        // An epoch with no accesses carries no signal; treat it as
        // steady state rather than reacting to a 0.0 hit rate.
        if self.resize.epoch_accesses == 0 {
            self.resize.mode = ResizeMode::Steady;
            self.resize.epochs_completed += 1;
            return Ok(());
        }
        let cfg = self.config.resize;
        let hit_rate = self.resize.epoch_hit_rate();
        let old_budget = self.max_size;
        let mut mode = ResizeMode::Steady;

        if cfg.incr_enabled && hit_rate < cfg.lower_hit_rate_threshold && old_budget < cfg.max_size
        {
            let mut grown = (old_budget as f64 * cfg.increment) as u64;
            if let Some(cap) = cfg.max_increment {
                grown = grown.min(old_budget.saturating_add(cap));
            }
            self.max_size = grown.min(cfg.max_size);
            mode = ResizeMode::Growing;
        } else if cfg.decr_enabled
            && hit_rate > cfg.upper_hit_rate_threshold
            && old_budget > cfg.min_size
        {
            let mut shrunk = (old_budget as f64 * cfg.decrement) as u64;
            if let Some(cap) = cfg.max_decrement {
                shrunk = shrunk.max(old_budget.saturating_sub(cap));
            }
            self.max_size = shrunk.max(cfg.min_size);
            mode = ResizeMode::Shrinking;
        }

        if self.max_size != old_budget {
            self.stats.resizes += 1;
            debug!(
                hit_rate,
                old_budget,
                new_budget = self.max_size,
                ?mode,
                epoch = self.resize.epochs_completed,
                "resize epoch adjusted budget"
            );
        }
        self.resize.mode = mode;
        self.resize.epoch_accesses = 0;
        self.resize.epoch_hits = 0;
        self.resize.epochs_completed += 1;

        if mode == ResizeMode::Shrinking {
            self.make_space(store, 0)?;
        }
        Ok(())
    }

    /// Minimum number of clean bytes the engine aims to keep, derived
    /// from the current budget.
    pub(crate) fn min_clean_size(&self) -> u64 {
        (self.max_size as f64 * self.config.min_clean_fraction) as u64
    }
}
