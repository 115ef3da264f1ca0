//! Execution scheduler - decides how many actions of a stage run at once

use crate::core::config::{Settings, StrategyKind};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Strategy for dispatching the actions of a stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SchedulingStrategy {
    /// One action at a time, in declared order
    #[default]
    Sequential,

    /// Every action of the stage at once
    Parallel,

    /// At most N actions at once
    LimitedParallel(usize),
}

impl SchedulingStrategy {
    /// Number of actions allowed to run concurrently in a stage of `actions`
    pub fn permits(&self, actions: usize) -> usize {
        let permits = match self {
            SchedulingStrategy::Sequential => 1,
            SchedulingStrategy::Parallel => actions,
            SchedulingStrategy::LimitedParallel(max) => (*max).min(actions),
        };
        permits.max(1)
    }

    /// Semaphore gating dispatch for one stage
    pub fn semaphore(&self, actions: usize) -> Arc<Semaphore> {
        Arc::new(Semaphore::new(self.permits(actions)))
    }
}

impl From<&Settings> for SchedulingStrategy {
    fn from(settings: &Settings) -> Self {
        match settings.strategy {
            StrategyKind::Sequential => SchedulingStrategy::Sequential,
            StrategyKind::Parallel => SchedulingStrategy::Parallel,
            StrategyKind::Limited => SchedulingStrategy::LimitedParallel(settings.max_parallel),
        }
    }
}
