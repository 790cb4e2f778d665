//! Time-sliced tasks.
//!
//! A task is a FIFO queue of resumable steps. Each `run` keeps invoking the
//! head step until the queue drains or the wall-clock budget is exceeded, in
//! which case the task is left suspended with its queue and the head step's
//! progress intact, ready for the next tick.

use std::collections::VecDeque;
use std::sync::Arc;

use stablemaster_core::Clock;
use tracing::{debug, trace};

/// One resumable unit of work.
pub trait Step<C: ?Sized> {
    /// Do a bounded amount of work. Returns `true` while more work remains.
    fn advance(&mut self, ctx: &mut C) -> bool;
}

impl<C: ?Sized, F> Step<C> for F
where
    F: FnMut(&mut C) -> bool,
{
    fn advance(&mut self, ctx: &mut C) -> bool {
        self(ctx)
    }
}

/// Scheduling state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Nothing queued
    Idle,
    /// Inside `run`
    Running,
    /// Out of budget with work left; resume on the next tick
    Suspended,
}

/// A queue of steps executed under a per-run time budget.
pub struct TimeSlicedTask<C: ?Sized> {
    name: String,
    steps: VecDeque<Box<dyn Step<C>>>,
    budget_micros: i64,
    clock: Arc<dyn Clock>,
    state: TaskState,
    runs: u64,
}

impl<C: ?Sized> TimeSlicedTask<C> {
    /// Create an empty task with a budget in microseconds.
    pub fn new(name: impl Into<String>, budget_micros: i64, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            steps: VecDeque::new(),
            budget_micros,
            clock,
            state: TaskState::Idle,
            runs: 0,
        }
    }

    /// Append a step to the queue.
    pub fn push(&mut self, step: impl Step<C> + 'static) {
        self.steps.push_back(Box::new(step));
    }

    /// Builder form of [`TimeSlicedTask::push`].
    pub fn with_step(mut self, step: impl Step<C> + 'static) -> Self {
        self.push(step);
        self
    }

    /// Task name, used in logs and to deduplicate scheduled tasks.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state.
    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Number of steps still queued.
    pub fn pending(&self) -> usize {
        self.steps.len()
    }

    /// Whether work remains.
    pub fn has_work(&self) -> bool {
        !self.steps.is_empty()
    }

    /// Number of `run` calls so far.
    pub fn runs(&self) -> u64 {
        self.runs
    }

    /// Execute steps until the queue drains or the budget is spent.
    ///
    /// The budget is checked only after a step invocation, so every call
    /// makes progress even with a zero or negative budget.
    pub fn run(&mut self, ctx: &mut C) -> TaskState {
        if self.steps.is_empty() {
            self.state = TaskState::Idle;
            return self.state;
        }

        self.state = TaskState::Running;
        self.runs += 1;
        let started = self.clock.now_micros();
        let mut invocations = 0u64;

        while let Some(step) = self.steps.front_mut() {
            invocations += 1;
            if !step.advance(ctx) {
                self.steps.pop_front();
                trace!(task = %self.name, "Step exhausted, {} left", self.steps.len());
            }
            if self.steps.is_empty() {
                break;
            }

            let elapsed = self.clock.now_micros().saturating_sub(started);
            if i64::try_from(elapsed).unwrap_or(i64::MAX) > self.budget_micros {
                debug!(
                    task = %self.name,
                    "Yielding after {} invocations ({}us > {}us budget), {} steps left",
                    invocations,
                    elapsed,
                    self.budget_micros,
                    self.steps.len()
                );
                self.state = TaskState::Suspended;
                return self.state;
            }
        }

        debug!(task = %self.name, "Finished after {} runs", self.runs);
        self.state = TaskState::Idle;
        self.state
    }
}

impl<C: ?Sized> std::fmt::Debug for TimeSlicedTask<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeSlicedTask")
            .field("name", &self.name)
            .field("pending", &self.steps.len())
            .field("budget_micros", &self.budget_micros)
            .field("state", &self.state)
            .finish()
    }
}
