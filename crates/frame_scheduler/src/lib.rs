//! Per-tick budget for owner-thread finalization of staged tile resources.
//!
//! The budget is an allowance between a floor and a ceiling. With a time
//! target configured, the allowance shrinks after ticks whose finalization
//! ran over the target and grows back after cheap ones. The floor keeps the
//! backlog moving even when every tick runs long.

use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalizeSchedulerConfig {
    pub max_finalizations_per_tick: u32,
    pub min_finalizations_per_tick: u32,
    /// Owner-thread time the finalizations of one tick should fit in.
    /// `0` keeps the allowance at the ceiling.
    pub target_finalize_micros: u64,
}

impl Default for FinalizeSchedulerConfig {
    fn default() -> Self {
        Self {
            max_finalizations_per_tick: 64,
            min_finalizations_per_tick: 1,
            target_finalize_micros: 4_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalizeSchedulerInput {
    pub tick: u64,
    pub pending_finalizations: u32,
    /// Time the previous tick spent finalizing, if it finalized anything.
    pub previous_finalize_micros: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BacklogTransition {
    Started,
    Drained,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalizeSchedulerDecision {
    pub tick: u64,
    pub finalizations_to_run: u32,
    /// Finalizations left queued for later ticks.
    pub deferred: u32,
    /// Allowance after adapting to the previous tick.
    pub allowance: u32,
    pub transition: Option<BacklogTransition>,
}

#[derive(Debug, Clone)]
pub struct FinalizeScheduler {
    config: FinalizeSchedulerConfig,
    allowance: u32,
    backlog: bool,
}

impl FinalizeScheduler {
    pub fn new(config: FinalizeSchedulerConfig) -> Self {
        assert!(
            config.min_finalizations_per_tick <= config.max_finalizations_per_tick,
            "invalid finalize scheduler config: min_finalizations_per_tick ({}) exceeds max_finalizations_per_tick ({})",
            config.min_finalizations_per_tick,
            config.max_finalizations_per_tick
        );
        Self {
            config,
            allowance: config.max_finalizations_per_tick,
            backlog: false,
        }
    }

    pub fn config(&self) -> FinalizeSchedulerConfig {
        self.config
    }

    pub fn allowance(&self) -> u32 {
        self.allowance
    }

    pub fn has_backlog(&self) -> bool {
        self.backlog
    }

    fn floor(&self) -> u32 {
        self.config.min_finalizations_per_tick.max(1)
    }

    fn adapt(&mut self, previous_micros: Option<u64>) {
        let target = self.config.target_finalize_micros;
        let Some(spent) = previous_micros else {
            return;
        };
        if target == 0 {
            return;
        }
        let before = self.allowance;
        if spent > target {
            self.allowance = (self.allowance / 2).max(self.floor());
        } else if spent.saturating_mul(2) < target {
            self.allowance = self
                .allowance
                .saturating_mul(2)
                .min(self.config.max_finalizations_per_tick);
        }
        if self.allowance != before {
            trace!(spent, target, before, after = self.allowance, "finalize allowance adapted");
        }
    }

    pub fn schedule_tick(&mut self, input: FinalizeSchedulerInput) -> FinalizeSchedulerDecision {
        self.adapt(input.previous_finalize_micros);

        let pending = input.pending_finalizations;
        let had_backlog = self.backlog;
        self.backlog = pending > 0;
        let transition = match (had_backlog, self.backlog) {
            (false, true) => Some(BacklogTransition::Started),
            (true, false) => {
                debug!(tick = input.tick, "finalization backlog drained");
                Some(BacklogTransition::Drained)
            }
            _ => None,
        };

        let finalizations_to_run = pending.min(self.allowance);
        FinalizeSchedulerDecision {
            tick: input.tick,
            finalizations_to_run,
            deferred: pending - finalizations_to_run,
            allowance: self.allowance,
            transition,
        }
    }
}

impl Default for FinalizeScheduler {
    fn default() -> Self {
        Self::new(FinalizeSchedulerConfig::default())
    }
}
