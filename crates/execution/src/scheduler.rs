//! Tick-driven scheduling and budget management.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use stablemaster_core::{Clock, RateLimiter, ScanConfig, SystemClock};
use tracing::{debug, info};

use crate::sliced::{TaskState, TimeSlicedTask};

/// Time budget for scheduled work.
#[derive(Debug, Clone, Copy)]
pub struct Budget {
    /// Wall-clock budget for one `run` of a task, in microseconds
    pub per_run_micros: i64,
    /// Minimum interval between starts of the same keyed task
    pub start_cooldown: Duration,
}

impl Default for Budget {
    fn default() -> Self {
        Self::from(&ScanConfig::default())
    }
}

impl From<&ScanConfig> for Budget {
    fn from(config: &ScanConfig) -> Self {
        Self {
            per_run_micros: config.budget_micros,
            start_cooldown: Duration::from_millis(config.cooldown_ms),
        }
    }
}

impl Budget {
    /// Create a budget from the defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-run budget.
    pub fn with_per_run_micros(mut self, micros: i64) -> Self {
        self.per_run_micros = micros;
        self
    }

    /// Set the start cooldown.
    pub fn with_start_cooldown(mut self, cooldown: Duration) -> Self {
        self.start_cooldown = cooldown;
        self
    }
}

/// Owns the suspended tasks and runs each of them once per tick.
pub struct TaskScheduler<C: ?Sized> {
    budget: Budget,
    tasks: Vec<TimeSlicedTask<C>>,
    limiters: HashMap<String, RateLimiter>,
    clock: Arc<dyn Clock>,
    ticks: u64,
}

impl<C: ?Sized> TaskScheduler<C> {
    /// Create a scheduler on the system clock.
    pub fn new(budget: Budget) -> Self {
        Self::with_clock(budget, Arc::new(SystemClock::new()))
    }

    /// Create a scheduler on a specific clock. Tasks and limiters share it.
    pub fn with_clock(budget: Budget, clock: Arc<dyn Clock>) -> Self {
        Self {
            budget,
            tasks: Vec::new(),
            limiters: HashMap::new(),
            clock,
            ticks: 0,
        }
    }

    /// The budget applied to new tasks.
    pub fn budget(&self) -> Budget {
        self.budget
    }

    /// An empty task wired to this scheduler's budget and clock.
    pub fn task(&self, name: impl Into<String>) -> TimeSlicedTask<C> {
        TimeSlicedTask::new(name, self.budget.per_run_micros, self.clock.clone())
    }

    /// Queue a task for the next tick.
    pub fn submit(&mut self, task: TimeSlicedTask<C>) {
        debug!("Submitted task {} with {} steps", task.name(), task.pending());
        self.tasks.push(task);
    }

    /// Queue a task unless one with the same key is still running or the
    /// key was started within the cooldown. Returns whether it was queued.
    pub fn submit_limited(&mut self, key: &str, task: TimeSlicedTask<C>) -> bool {
        if self.is_running(task.name()) {
            debug!("Task {} already running, not starting another", task.name());
            return false;
        }

        let cooldown = self.budget.start_cooldown;
        let clock = self.clock.clone();
        let limiter = self
            .limiters
            .entry(key.to_string())
            .or_insert_with(|| RateLimiter::with_clock(cooldown, clock));
        if !limiter.try_acquire() {
            debug!("Task {} is cooling down", key);
            return false;
        }

        self.submit(task);
        true
    }

    /// Whether a task with this name is queued.
    pub fn is_running(&self, name: &str) -> bool {
        self.tasks.iter().any(|task| task.name() == name)
    }

    /// Run every queued task once and drop the finished ones.
    ///
    /// Returns the number of tasks still suspended.
    pub fn tick(&mut self, ctx: &mut C) -> usize {
        self.ticks += 1;
        for task in &mut self.tasks {
            if task.run(ctx) == TaskState::Idle {
                info!("Task {} finished after {} runs", task.name(), task.runs());
            }
        }
        self.tasks.retain(|task| task.has_work());
        self.tasks.len()
    }

    /// Whether nothing is queued.
    pub fn is_idle(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Number of ticks so far.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Drop every queued task.
    pub fn cancel_all(&mut self) {
        if !self.tasks.is_empty() {
            info!("Cancelling {} tasks", self.tasks.len());
        }
        self.tasks.clear();
    }
}
