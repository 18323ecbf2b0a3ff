//! Learning-rate schedules and the warmup → main [`ScheduleComposer`].

use serde::{Deserialize, Serialize};

// ── LrSchedule ──────────────────────────────────────────────────────────────

/// A learning-rate schedule advanced one step at a time.
pub trait LrSchedule: Send {
    /// Learning rate for the next optimiser step.
    fn current_lr(&self) -> f64;
    /// Advance by one step and return the new learning rate.
    fn step(&mut self) -> f64;
    fn step_count(&self) -> usize;
}

/// Cosine annealing from `base_lr` to `eta_min` over `t_max` steps (closed
/// form of PyTorch's `CosineAnnealingLR`).
#[derive(Debug, Clone)]
pub struct CosineAnnealing {
    base_lr: f64,
    eta_min: f64,
    t_max: usize,
    t: usize,
}

impl CosineAnnealing {
    pub fn new(base_lr: f64, eta_min: f64, t_max: usize) -> Self {
        Self {
            base_lr,
            eta_min,
            t_max: t_max.max(1),
            t: 0,
        }
    }
}

impl LrSchedule for CosineAnnealing {
    fn current_lr(&self) -> f64 {
        let progress = self.t as f64 / self.t_max as f64;
        let cos = (std::f64::consts::PI * progress).cos();
        self.eta_min + 0.5 * (self.base_lr - self.eta_min) * (1.0 + cos)
    }

    fn step(&mut self) -> f64 {
        self.t += 1;
        self.current_lr()
    }

    fn step_count(&self) -> usize {
        self.t
    }
}

/// Triangular cyclic schedule between `base_lr` and `max_lr`.
#[derive(Debug, Clone)]
pub struct CyclicLr {
    base_lr: f64,
    max_lr: f64,
    step_size_up: usize,
    step_size_down: usize,
    t: usize,
}

impl CyclicLr {
    pub fn new(base_lr: f64, max_lr: f64, step_size_up: usize, step_size_down: Option<usize>) -> Self {
        let step_size_up = step_size_up.max(1);
        Self {
            base_lr,
            max_lr,
            step_size_up,
            step_size_down: step_size_down.unwrap_or(step_size_up).max(1),
            t: 0,
        }
    }
}

impl LrSchedule for CyclicLr {
    fn current_lr(&self) -> f64 {
        let total = (self.step_size_up + self.step_size_down) as f64;
        let up_ratio = self.step_size_up as f64 / total;
        let cycle = (1.0 + self.t as f64 / total).floor();
        let x = 1.0 + self.t as f64 / total - cycle;
        let scale = if x <= up_ratio {
            x / up_ratio
        } else {
            (x - 1.0) / (up_ratio - 1.0)
        };
        self.base_lr + (self.max_lr - self.base_lr) * scale
    }

    fn step(&mut self) -> f64 {
        self.t += 1;
        self.current_lr()
    }

    fn step_count(&self) -> usize {
        self.t
    }
}

/// Linear ramp reaching `target_lr` after `steps` steps, constant afterwards.
#[derive(Debug, Clone)]
pub struct LinearWarmup {
    target_lr: f64,
    steps: usize,
    t: usize,
}

impl LinearWarmup {
    pub fn new(target_lr: f64, steps: usize) -> Self {
        Self {
            target_lr,
            steps: steps.max(1),
            t: 0,
        }
    }
}

impl LrSchedule for LinearWarmup {
    fn current_lr(&self) -> f64 {
        self.target_lr * ((self.t + 1) as f64 / self.steps as f64).min(1.0)
    }

    fn step(&mut self) -> f64 {
        self.t += 1;
        self.current_lr()
    }

    fn step_count(&self) -> usize {
        self.t
    }
}

#[derive(Debug, Clone)]
pub struct ConstantLr {
    lr: f64,
    t: usize,
}

impl ConstantLr {
    pub fn new(lr: f64) -> Self {
        Self { lr, t: 0 }
    }
}

impl LrSchedule for ConstantLr {
    fn current_lr(&self) -> f64 {
        self.lr
    }

    fn step(&mut self) -> f64 {
        self.t += 1;
        self.lr
    }

    fn step_count(&self) -> usize {
        self.t
    }
}

// ── Composer ────────────────────────────────────────────────────────────────

/// How often the runner advances the composer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    /// Once per optimiser step.
    Batch,
    /// Once per epoch. Warmup still advances per batch.
    #[default]
    Epoch,
}

/// Shape of the warmup ramp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WarmupPolicy {
    /// Triangular cycle whose rising half spans the whole warmup.
    #[default]
    Cyclic,
    Linear,
}

impl WarmupPolicy {
    /// Ramp from `base_lr` to `max_lr` over `steps` steps.
    pub fn build(self, base_lr: f64, max_lr: f64, steps: usize) -> Box<dyn LrSchedule> {
        match self {
            Self::Cyclic => Box::new(CyclicLr::new(base_lr, max_lr, steps, None)),
            Self::Linear => Box::new(LinearWarmup::new(max_lr, steps)),
        }
    }
}

/// Which schedule a [`ScheduleComposer::step`] call advanced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Warmup,
    Main,
}

/// Routes steps to an optional warmup schedule for the first
/// `warmup_steps` calls, then to the main schedule.
///
/// The main schedule never advances during warmup.
pub struct ScheduleComposer {
    warmup: Option<Box<dyn LrSchedule>>,
    warmup_steps: usize,
    main: Box<dyn LrSchedule>,
    granularity: Granularity,
    t: usize,
}

impl ScheduleComposer {
    pub fn new(
        warmup: Option<(Box<dyn LrSchedule>, usize)>,
        main: Box<dyn LrSchedule>,
        granularity: Granularity,
    ) -> Self {
        let (warmup, warmup_steps) = match warmup {
            Some((schedule, steps)) => (Some(schedule), steps),
            None => (None, 0),
        };
        Self {
            warmup,
            warmup_steps,
            main,
            granularity,
            t: 0,
        }
    }

    pub fn in_warmup(&self) -> bool {
        self.warmup.is_some() && self.t < self.warmup_steps
    }

    /// Learning rate of the schedule that drives the next optimiser step.
    pub fn current_lr(&self) -> f64 {
        match &self.warmup {
            Some(warmup) if self.in_warmup() => warmup.current_lr(),
            _ => self.main.current_lr(),
        }
    }

    pub fn step(&mut self) -> Route {
        let route = match &mut self.warmup {
            Some(warmup) if self.t < self.warmup_steps => {
                warmup.step();
                Route::Warmup
            }
            _ => {
                self.main.step();
                Route::Main
            }
        };
        self.t += 1;
        tracing::trace!(t = self.t, ?route, lr = self.current_lr(), "Schedule step");
        route
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    /// Total `step()` calls so far.
    pub fn steps(&self) -> usize {
        self.t
    }

    pub fn warmup_steps(&self) -> usize {
        self.warmup_steps
    }

    pub fn main_step_count(&self) -> usize {
        self.main.step_count()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_endpoints_and_midpoint() {
        let mut sched = CosineAnnealing::new(1e-3, 0.0, 10);
        assert!((sched.current_lr() - 1e-3).abs() < 1e-12);
        for _ in 0..5 {
            sched.step();
        }
        // cos(π·0.5) = 0 → lr = 0.5 * 1e-3
        assert!((sched.current_lr() - 5e-4).abs() < 1e-12);
        for _ in 0..5 {
            sched.step();
        }
        assert!(sched.current_lr().abs() < 1e-12);
        assert_eq!(sched.step_count(), 10);
    }

    #[test]
    fn cyclic_triangle() {
        let mut sched = CyclicLr::new(0.0, 0.1, 4, None);
        let lrs: Vec<f64> = std::iter::once(sched.current_lr())
            .chain((0..8).map(|_| sched.step()))
            .collect();
        let expected = [0.0, 0.025, 0.05, 0.075, 0.1, 0.075, 0.05, 0.025, 0.0];
        for (got, want) in lrs.iter().zip(expected) {
            assert!((got - want).abs() < 1e-12, "{lrs:?}");
        }
    }

    #[test]
    fn linear_warmup_saturates() {
        let mut sched = LinearWarmup::new(0.1, 4);
        assert!((sched.current_lr() - 0.025).abs() < 1e-12);
        for _ in 0..10 {
            sched.step();
        }
        assert!((sched.current_lr() - 0.1).abs() < 1e-12);
    }

    #[test]
    fn composer_routes_warmup_then_main() {
        let w = 3;
        let mut composer = ScheduleComposer::new(
            Some((Box::new(CyclicLr::new(0.0, 0.1, w, None)), w)),
            Box::new(CosineAnnealing::new(0.1, 0.0, 10)),
            Granularity::Batch,
        );
        for _ in 0..w {
            assert!(composer.in_warmup());
            assert_eq!(composer.step(), Route::Warmup);
            assert_eq!(composer.main_step_count(), 0);
        }
        assert_eq!(composer.step(), Route::Main);
        assert_eq!(composer.main_step_count(), 1);
        assert_eq!(composer.steps(), w + 1);
    }

    #[test]
    fn composer_without_warmup_goes_straight_to_main() {
        let mut composer =
            ScheduleComposer::new(None, Box::new(ConstantLr::new(0.01)), Granularity::Epoch);
        assert!(!composer.in_warmup());
        assert_eq!(composer.step(), Route::Main);
        assert_eq!(composer.main_step_count(), 1);
        assert_eq!(composer.granularity(), Granularity::Epoch);
    }

    #[test]
    fn composer_lr_follows_active_schedule() {
        let mut composer = ScheduleComposer::new(
            Some((WarmupPolicy::Linear.build(0.0, 0.2, 2), 2)),
            Box::new(ConstantLr::new(0.05)),
            Granularity::Batch,
        );
        assert!((composer.current_lr() - 0.1).abs() < 1e-12);
        composer.step();
        assert!((composer.current_lr() - 0.2).abs() < 1e-12);
        composer.step();
        assert!((composer.current_lr() - 0.05).abs() < 1e-12);
    }

    #[test]
    fn zero_length_warmup_is_skipped() {
        let mut composer = ScheduleComposer::new(
            Some((WarmupPolicy::Cyclic.build(0.0, 0.1, 0), 0)),
            Box::new(ConstantLr::new(0.01)),
            Granularity::Batch,
        );
        assert_eq!(composer.step(), Route::Main);
    }
}
