//! Learning rate schedules with linear warmup.

use std::f64::consts::PI;

use crate::config::{LrScheduler, TrainingConfig};

/// Learning rate as a function of completed optimizer steps.
///
/// Warmup ramps linearly from `0` to the base rate over `warmup_steps`; the
/// decay phase then follows the configured [`LrScheduler`] down to `0` at
/// `total_steps`.
#[derive(Debug, Clone)]
pub struct LRScheduler {
    base_lr: f64,
    total_steps: usize,
    warmup_steps: usize,
    kind: LrScheduler,
    current_step: usize,
}

impl LRScheduler {
    /// Create a scheduler.
    #[must_use]
    pub fn new(base_lr: f64, total_steps: usize, warmup_steps: usize, kind: LrScheduler) -> Self {
        Self {
            base_lr,
            total_steps,
            warmup_steps,
            kind,
            current_step: 0,
        }
    }

    /// Scheduler for a run of `total_steps` optimizer steps.
    #[must_use]
    pub fn from_training(training: &TrainingConfig, total_steps: usize) -> Self {
        Self::new(
            training.learning_rate,
            total_steps,
            training.warmup_steps_for(total_steps),
            training.lr_scheduler,
        )
    }

    /// Multiplier applied to the base rate at `step`.
    #[must_use]
    pub fn factor(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return step as f64 / self.warmup_steps.max(1) as f64;
        }
        let decay_steps = self.total_steps.saturating_sub(self.warmup_steps).max(1) as f64;
        let done = step.saturating_sub(self.warmup_steps) as f64;

        match self.kind {
            LrScheduler::Constant => 1.0,
            LrScheduler::Linear => {
                let remaining = self.total_steps.saturating_sub(step) as f64;
                (remaining / decay_steps).max(0.0)
            }
            LrScheduler::Cosine => {
                let progress = done / decay_steps;
                (0.5 * (1.0 + (PI * progress).cos())).max(0.0)
            }
        }
    }

    /// Learning rate at `step`.
    #[must_use]
    pub fn lr_at(&self, step: usize) -> f64 {
        self.base_lr * self.factor(step)
    }

    /// Learning rate for the next optimizer step.
    #[must_use]
    pub fn current_lr(&self) -> f64 {
        self.lr_at(self.current_step)
    }

    /// Advance by one optimizer step.
    pub fn step(&mut self) {
        self.current_step += 1;
    }

    /// Jump to `step`, e.g. after resuming from a checkpoint.
    pub fn set_step(&mut self, step: usize) {
        self.current_step = step;
    }

    /// Completed optimizer steps.
    #[must_use]
    pub fn current_step(&self) -> usize {
        self.current_step
    }

    /// Warmup length.
    #[must_use]
    pub fn warmup_steps(&self) -> usize {
        self.warmup_steps
    }
}
