//! Training actions and the level sink.

use stablemaster_core::{Ability, ProgressionRecord};

/// One unit of training applied to a mount.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Training {
    /// Distance ridden, trains speed
    Travelled(f64),
    /// Height jumped, trains jump
    Jumped(f64),
    /// Consumables eaten, trains health
    Fed(u64),
}

impl Training {
    /// The ability this training feeds.
    pub fn ability(&self) -> Ability {
        match self {
            Training::Travelled(_) => Ability::Speed,
            Training::Jumped(_) => Ability::Jump,
            Training::Fed(_) => Ability::Health,
        }
    }

    /// Effort contributed, or `None` for negative or non-finite amounts.
    pub fn effort(&self) -> Option<f64> {
        let effort = match *self {
            Training::Travelled(d) | Training::Jumped(d) => d,
            Training::Fed(n) => n as f64,
        };
        (effort.is_finite() && effort >= 0.0).then_some(effort)
    }

    /// Update the matching counter and effort.
    pub(crate) fn apply(&self, record: &mut ProgressionRecord, effort: f64) {
        match *self {
            Training::Travelled(d) => record.distance_travelled += d,
            Training::Jumped(h) => record.distance_jumped += h,
            Training::Fed(n) => record.consumed = record.consumed.saturating_add(n),
        }
        *record.effort.get_mut(self.ability()) += effort;
    }
}

/// Receives derived levels to push onto the live entity.
///
/// The store only keeps effort; applying the resulting attribute is the
/// host's job.
pub trait LevelSink {
    /// Apply `level` of `ability` to the live counterpart of `record`.
    fn apply_level(&mut self, record: &ProgressionRecord, ability: Ability, level: u32);
}

impl<F> LevelSink for F
where
    F: FnMut(&ProgressionRecord, Ability, u32),
{
    fn apply_level(&mut self, record: &ProgressionRecord, ability: Ability, level: u32) {
        self(record, ability, level)
    }
}
