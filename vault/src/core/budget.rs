//! Safety bounds for the iterative agent loop.

use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};

/// Absolute ceiling on Ralph iterations; configuration may only lower it.
pub const HARD_MAX_ITERATIONS: u32 = 15;
/// Absolute ceiling on Ralph wall-clock time; configuration may only lower it.
pub const HARD_MAX_DURATION: Duration = Duration::from_secs(2 * 60 * 60);

/// Limits applied to a single Ralph run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopLimits {
    pub max_iterations: u32,
    pub max_duration: Duration,
    /// Fixed pause between iterations.
    pub iteration_delay: Duration,
}

impl Default for LoopLimits {
    fn default() -> Self {
        Self {
            max_iterations: HARD_MAX_ITERATIONS,
            max_duration: HARD_MAX_DURATION,
            iteration_delay: Duration::from_secs(10),
        }
    }
}

impl LoopLimits {
    /// Clamp to the hard ceilings.
    pub fn clamped(self) -> Self {
        Self {
            max_iterations: self.max_iterations.clamp(1, HARD_MAX_ITERATIONS),
            max_duration: self.max_duration.min(HARD_MAX_DURATION),
            iteration_delay: self.iteration_delay,
        }
    }
}

/// Which bound, if any, stops the loop before `next_iteration` starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetExhausted {
    Iterations { max_iterations: u32 },
    WallClock { max_duration: Duration },
}

/// Tracks iteration count and elapsed time for one loop run.
#[derive(Debug, Clone)]
pub struct LoopBudget {
    limits: LoopLimits,
    started: Instant,
}

impl LoopBudget {
    pub fn start(limits: LoopLimits) -> Self {
        Self {
            limits: limits.clamped(),
            started: Instant::now(),
        }
    }

    pub fn limits(&self) -> LoopLimits {
        self.limits
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn deadline(&self) -> Instant {
        self.started + self.limits.max_duration
    }

    /// Check the bounds before running iteration `next_iteration` (1-based).
    pub fn check(&self, next_iteration: u32) -> Option<BudgetExhausted> {
        if next_iteration > self.limits.max_iterations {
            return Some(BudgetExhausted::Iterations {
                max_iterations: self.limits.max_iterations,
            });
        }
        if self.elapsed() >= self.limits.max_duration {
            return Some(BudgetExhausted::WallClock {
                max_duration: self.limits.max_duration,
            });
        }
        None
    }
}

/// Return the remaining time budget until the provided deadline.
pub fn remaining_budget(deadline: Instant) -> Result<Duration> {
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .unwrap_or(Duration::from_secs(0));
    if remaining.is_zero() {
        return Err(anyhow!("loop time budget exhausted"));
    }
    Ok(remaining)
}
