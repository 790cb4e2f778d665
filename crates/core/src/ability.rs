//! Ability progression model - effort to level to attribute value.
//!
//! Every trainable ability follows the same logarithmic curve:
//!
//! ```text
//! effort(L) = K * (B^(L-1) - 1)
//! level(E)  = 1 + ln(1 + E/K) / ln(B)
//! B         = (1 + maxEffort/K)^(1/(maxLevel-1))
//! ```
//!
//! Levels are never stored; they are always derived from the cumulative effort.

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::config::{AbilitiesConfig, ConfigError};

/// Tolerance used when flooring fractional levels, so that
/// `quantized_level(effort_for_level(L)) == L` survives rounding.
const LEVEL_EPSILON: f64 = 1e-9;

/// Converts the speed attribute into blocks per second.
const SPEED_TO_BLOCKS_PER_SECOND: f64 = 42.16;

/// Per-tick gravity applied to a jump.
const JUMP_GRAVITY: f64 = 0.08;

/// Per-tick vertical drag applied to a jump.
const JUMP_DRAG: f64 = 0.98;

/// A trainable ability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ability {
    /// Movement speed, trained by riding distance
    Speed,
    /// Jump strength, trained by jumping
    Jump,
    /// Maximum health, trained by feeding
    Health,
}

impl Ability {
    /// All abilities, in display order.
    pub const ALL: [Ability; 3] = [Ability::Speed, Ability::Jump, Ability::Health];

    /// Lowercase name used in config files and commands.
    pub fn name(&self) -> &'static str {
        match self {
            Ability::Speed => "speed",
            Ability::Jump => "jump",
            Ability::Health => "health",
        }
    }

    /// Unit of the human-facing display value.
    pub fn unit(&self) -> &'static str {
        match self {
            Ability::Speed => "blocks/s",
            Ability::Jump => "blocks",
            Ability::Health => "hearts",
        }
    }

    /// Convert a raw attribute value into the human-facing unit.
    pub fn display(&self, value: f64) -> f64 {
        match self {
            Ability::Speed => value * SPEED_TO_BLOCKS_PER_SECOND,
            Ability::Jump => jump_height(value),
            Ability::Health => value / 2.0,
        }
    }
}

impl std::fmt::Display for Ability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Ability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "speed" => Ok(Ability::Speed),
            "jump" => Ok(Ability::Jump),
            "health" => Ok(Ability::Health),
            other => Err(format!("unknown ability '{}'", other)),
        }
    }
}

/// Estimate the height reached by a jump with the given initial velocity.
///
/// Fixed-step integration: each tick adds the current velocity, then applies
/// gravity and drag, until the velocity is spent.
pub fn jump_height(velocity: f64) -> f64 {
    let mut velocity = velocity;
    let mut height = 0.0;
    while velocity > 0.0 {
        height += velocity;
        velocity -= JUMP_GRAVITY;
        velocity *= JUMP_DRAG;
    }
    height
}

/// Configuration for one trainable ability.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AbilityDefinition {
    /// Highest reachable level (>= 2)
    pub max_level: u32,
    /// Effort required to reach `max_level` (>= 1.0)
    pub max_effort: f64,
    /// Curve scale "K" (> 0)
    pub effort_scale: f64,
    /// Attribute value at level 1
    pub min_value: f64,
    /// Attribute value at `max_level`
    pub max_value: f64,
}

impl AbilityDefinition {
    /// Default definition for an ability.
    pub fn default_for(ability: Ability) -> Self {
        match ability {
            Ability::Speed => Self {
                max_level: 30,
                max_effort: 500_000.0,
                effort_scale: 10_000.0,
                min_value: 0.1125,
                max_value: 0.3375,
            },
            Ability::Jump => Self {
                max_level: 30,
                max_effort: 5_000.0,
                effort_scale: 100.0,
                min_value: 0.4,
                max_value: 1.0,
            },
            Ability::Health => Self {
                max_level: 30,
                max_effort: 500.0,
                effort_scale: 10.0,
                min_value: 15.0,
                max_value: 30.0,
            },
        }
    }

    /// Check the parameters and derive the curve base.
    pub fn validate(&self, ability: Ability) -> Result<f64, ConfigError> {
        let name = ability.name().to_string();
        if self.max_level < 2 {
            return Err(ConfigError::InvalidMaxLevel { ability: name, value: self.max_level });
        }
        if !self.max_effort.is_finite() || self.max_effort < 1.0 {
            return Err(ConfigError::InvalidMaxEffort { ability: name, value: self.max_effort });
        }
        if !self.effort_scale.is_finite() || self.effort_scale <= 0.0 {
            return Err(ConfigError::InvalidEffortScale { ability: name, value: self.effort_scale });
        }
        if !self.min_value.is_finite() || !self.max_value.is_finite() {
            return Err(ConfigError::InvalidValueRange {
                ability: name,
                min: self.min_value,
                max: self.max_value,
            });
        }

        let base = (1.0 + self.max_effort / self.effort_scale)
            .powf(1.0 / f64::from(self.max_level - 1));
        if !base.is_finite() || base <= 1.0 {
            return Err(ConfigError::DegenerateCurve { ability: name, base });
        }
        Ok(base)
    }
}

/// The fitted progression curve for one ability.
#[derive(Debug, Clone, PartialEq)]
pub struct AbilityModel {
    ability: Ability,
    definition: AbilityDefinition,
    effort_base: f64,
    ln_base: f64,
}

impl AbilityModel {
    /// Fit a model, rejecting invalid parameters.
    pub fn new(ability: Ability, definition: AbilityDefinition) -> Result<Self, ConfigError> {
        let effort_base = definition.validate(ability)?;
        Ok(Self {
            ability,
            definition,
            effort_base,
            ln_base: effort_base.ln(),
        })
    }

    /// Replace the parameters, keeping the current ones if the new set is invalid.
    pub fn reload(&mut self, definition: AbilityDefinition) -> Result<(), ConfigError> {
        match Self::new(self.ability, definition) {
            Ok(model) => {
                *self = model;
                Ok(())
            }
            Err(e) => {
                error!(ability = %self.ability, "Rejected ability config, keeping previous values: {}", e);
                Err(e)
            }
        }
    }

    /// The ability this model describes.
    pub fn ability(&self) -> Ability {
        self.ability
    }

    /// The active definition.
    pub fn definition(&self) -> &AbilityDefinition {
        &self.definition
    }

    /// Highest reachable level.
    pub fn max_level(&self) -> u32 {
        self.definition.max_level
    }

    /// Derived curve base "B".
    pub fn effort_base(&self) -> f64 {
        self.effort_base
    }

    /// Cumulative effort at which `level` is reached.
    ///
    /// Levels at or below 1 need no effort. Levels above `max_level` are
    /// extrapolated along the same curve so administrators can grant them.
    pub fn effort_for_level(&self, level: u32) -> f64 {
        if level <= 1 {
            return 0.0;
        }
        self.definition.effort_scale * (f64::from(level - 1) * self.ln_base).exp_m1()
    }

    /// Uncapped fractional level for an effort value.
    pub fn level_for_effort(&self, effort: f64) -> f64 {
        let effort = effort.max(0.0);
        1.0 + (effort / self.definition.effort_scale).ln_1p() / self.ln_base
    }

    /// Integer level, floored and capped at `max_level`.
    pub fn quantized_level(&self, effort: f64) -> u32 {
        self.raw_level(effort).min(self.definition.max_level)
    }

    /// Floored level without the cap.
    fn raw_level(&self, effort: f64) -> u32 {
        let level = (self.level_for_effort(effort) + LEVEL_EPSILON).floor();
        if level >= f64::from(u32::MAX) {
            u32::MAX
        } else {
            (level as u32).max(1)
        }
    }

    /// Whether the effort reaches the cap.
    pub fn is_capped(&self, effort: f64) -> bool {
        self.raw_level(effort) >= self.definition.max_level
    }

    /// Attribute value for a level, linear over `[1, max_level]` and
    /// extrapolated outside it.
    pub fn value_for_level(&self, level: f64) -> f64 {
        let d = &self.definition;
        let span = f64::from(d.max_level - 1);
        d.min_value + (d.max_value - d.min_value) * (level - 1.0) / span
    }

    /// Human-facing value for a level (blocks/s, blocks or hearts).
    pub fn display_value_for_level(&self, level: f64) -> f64 {
        self.ability.display(self.value_for_level(level))
    }

    /// Whether stored effort is past `max_effort`.
    pub fn is_overflowing(&self, effort: f64) -> bool {
        let max_effort = self.definition.max_effort;
        effort - max_effort > LEVEL_EPSILON * max_effort
    }

    /// Level label such as `7/30`, `30/30 (max)` or `34/30 (max+)`.
    ///
    /// `(max+)` marks any effort past `max_effort`, even before it adds a
    /// whole level.
    pub fn format_level(&self, effort: f64) -> String {
        let max = self.definition.max_level;
        let raw = self.raw_level(effort);
        if self.is_overflowing(effort) {
            format!("{}/{} (max+)", raw.max(max), max)
        } else if raw >= max {
            format!("{}/{} (max)", max, max)
        } else {
            format!("{}/{}", raw, max)
        }
    }
}

/// The fitted models for every ability.
#[derive(Debug, Clone, PartialEq)]
pub struct AbilityModels {
    speed: AbilityModel,
    jump: AbilityModel,
    health: AbilityModel,
}

impl AbilityModels {
    /// Fit all models, failing on the first invalid definition.
    pub fn from_config(config: &AbilitiesConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            speed: AbilityModel::new(Ability::Speed, config.speed)?,
            jump: AbilityModel::new(Ability::Jump, config.jump)?,
            health: AbilityModel::new(Ability::Health, config.health)?,
        })
    }

    /// Re-fit every model; invalid definitions keep their previous model.
    ///
    /// Returns the errors for the definitions that were rejected.
    pub fn reload(&mut self, config: &AbilitiesConfig) -> Vec<ConfigError> {
        Ability::ALL
            .iter()
            .filter_map(|&ability| {
                let definition = *config.get(ability);
                self.get_mut(ability).reload(definition).err()
            })
            .collect()
    }

    /// Model for an ability.
    pub fn get(&self, ability: Ability) -> &AbilityModel {
        match ability {
            Ability::Speed => &self.speed,
            Ability::Jump => &self.jump,
            Ability::Health => &self.health,
        }
    }

    fn get_mut(&mut self, ability: Ability) -> &mut AbilityModel {
        match ability {
            Ability::Speed => &mut self.speed,
            Ability::Jump => &mut self.jump,
            Ability::Health => &mut self.health,
        }
    }
}

impl Default for AbilityModels {
    fn default() -> Self {
        let fit = |ability: Ability| {
            let definition = AbilityDefinition::default_for(ability);
            let effort_base = (1.0 + definition.max_effort / definition.effort_scale)
                .powf(1.0 / f64::from(definition.max_level - 1));
            AbilityModel {
                ability,
                definition,
                effort_base,
                ln_base: effort_base.ln(),
            }
        };
        Self {
            speed: fit(Ability::Speed),
            jump: fit(Ability::Jump),
            health: fit(Ability::Health),
        }
    }
}
