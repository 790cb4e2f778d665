//! Progression record - the persistent state of one mount.

use crate::ability::Ability;
use crate::id::{MountId, PlayerId};
use crate::Time;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A position in a named world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// World name
    pub world: String,
    /// X coordinate
    pub x: f64,
    /// Y coordinate
    pub y: f64,
    /// Z coordinate
    pub z: f64,
    /// Horizontal facing
    #[serde(default)]
    pub yaw: f32,
    /// Vertical facing
    #[serde(default)]
    pub pitch: f32,
}

impl Location {
    /// Create a location with neutral orientation.
    pub fn new(world: impl Into<String>, x: f64, y: f64, z: f64) -> Self {
        Self {
            world: world.into(),
            x,
            y,
            z,
            yaw: 0.0,
            pitch: 0.0,
        }
    }

    /// Straight-line distance, or `None` when the worlds differ.
    pub fn distance_to(&self, other: &Location) -> Option<f64> {
        if self.world != other.world {
            return None;
        }
        let (dx, dy, dz) = (self.x - other.x, self.y - other.y, self.z - other.z);
        Some((dx * dx + dy * dy + dz * dz).sqrt())
    }
}

/// Cumulative training effort per ability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Efforts {
    /// Speed effort
    pub speed: f64,
    /// Jump effort
    pub jump: f64,
    /// Health effort
    pub health: f64,
}

impl Efforts {
    /// Effort for an ability.
    pub fn get(&self, ability: Ability) -> f64 {
        match ability {
            Ability::Speed => self.speed,
            Ability::Jump => self.jump,
            Ability::Health => self.health,
        }
    }

    /// Mutable effort for an ability.
    pub fn get_mut(&mut self, ability: Ability) -> &mut f64 {
        match ability {
            Ability::Speed => &mut self.speed,
            Ability::Jump => &mut self.jump,
            Ability::Health => &mut self.health,
        }
    }
}

/// Persistent progression state for one mount.
///
/// Transient flags (dirty, debug) live in the store, not here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressionRecord {
    /// Stable identifier
    pub id: MountId,

    /// Owning player, if tamed
    #[serde(default)]
    pub owner: Option<PlayerId>,

    /// Display name given by the owner
    #[serde(default)]
    pub name: Option<String>,

    /// Cumulative effort per ability
    #[serde(default)]
    pub effort: Efforts,

    /// Total distance ridden
    #[serde(default)]
    pub distance_travelled: f64,

    /// Total height jumped
    #[serde(default)]
    pub distance_jumped: f64,

    /// Consumables eaten
    #[serde(default)]
    pub consumed: u64,

    /// Last known location
    #[serde(default)]
    pub location: Option<Location>,

    /// When the mount was last observed in the world
    #[serde(default)]
    pub last_observed: Option<Time>,

    /// When the mount was last ridden or changed hands
    #[serde(default)]
    pub last_ridden: Option<Time>,

    /// Players allowed to ride besides the owner
    #[serde(default)]
    pub trusted: BTreeSet<PlayerId>,
}

impl ProgressionRecord {
    /// A fresh record at level 1 in every ability.
    pub fn new(id: MountId, owner: Option<PlayerId>) -> Self {
        Self {
            id,
            owner,
            name: None,
            effort: Efforts::default(),
            distance_travelled: 0.0,
            distance_jumped: 0.0,
            consumed: 0,
            location: None,
            last_observed: None,
            last_ridden: None,
            trusted: BTreeSet::new(),
        }
    }

    /// Whether the player may ride this mount.
    pub fn can_use(&self, player: PlayerId) -> bool {
        self.owner == Some(player) || self.trusted.contains(&player)
    }
}

/// What the host saw of a live mount at one moment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    /// Identifier of the live entity
    pub id: MountId,
    /// Owner reported by the world
    #[serde(default)]
    pub owner: Option<PlayerId>,
    /// Current position
    pub location: Location,
    /// Player currently riding, if any
    #[serde(default)]
    pub rider: Option<PlayerId>,
    /// Saddle equipped
    #[serde(default)]
    pub saddled: bool,
    /// Armor equipped
    #[serde(default)]
    pub armored: bool,
    /// Chest attached
    #[serde(default)]
    pub chested: bool,
}

impl EntitySnapshot {
    /// Snapshot of an idle, unequipped mount.
    pub fn new(id: MountId, location: Location) -> Self {
        Self {
            id,
            owner: None,
            location,
            rider: None,
            saddled: false,
            armored: false,
            chested: false,
        }
    }
}
