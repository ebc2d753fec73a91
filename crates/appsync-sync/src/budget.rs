//! Wall-clock ceiling for one invocation.

use std::time::Duration;

use tokio::time::Instant;

/// Shorter than an hourly scheduling slot so the run can wind down cleanly.
pub const DEFAULT_RUN_BUDGET: Duration = Duration::from_secs(58 * 60);

/// Checked only between batches, so a run may overrun by one batch.
#[derive(Debug, Clone, Copy)]
pub struct RunBudget {
    started: Instant,
    ceiling: Duration,
}

impl RunBudget {
    pub fn start(ceiling: Duration) -> Self {
        Self {
            started: Instant::now(),
            ceiling,
        }
    }

    pub fn has_time_remaining(&self) -> bool {
        self.started.elapsed() < self.ceiling
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.ceiling.saturating_sub(self.started.elapsed())
    }
}

impl Default for RunBudget {
    fn default() -> Self {
        Self::start(DEFAULT_RUN_BUDGET)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn budget_runs_out_at_ceiling() {
        let budget = RunBudget::start(Duration::from_secs(5));
        assert!(budget.has_time_remaining());

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(budget.has_time_remaining());
        assert_eq!(budget.remaining(), Duration::from_secs(1));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!budget.has_time_remaining());
        assert_eq!(budget.remaining(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_budget_is_exhausted_immediately() {
        assert!(!RunBudget::start(Duration::ZERO).has_time_remaining());
    }
}
