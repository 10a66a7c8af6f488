use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

/// Overrides shipped with the reference board: outputs 9..=12 are wired one
/// header position further along.
pub const DEFAULT_OVERRIDES: [(u16, u16); 4] = [(9, 10), (10, 11), (11, 12), (12, 13)];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MapError {
    #[error("channel count must be at least 1")]
    Empty,
    #[error("override source {logical} is not a logical channel (0..{count})")]
    LogicalOutOfRange { logical: u16, count: u16 },
    #[error("override {logical} -> {physical} points past the last channel ({count})")]
    PhysicalOutOfRange { logical: u16, physical: u16, count: u16 },
    #[error("overrides {first} and {second} both point at physical channel {physical}")]
    DuplicateOverride { first: u16, second: u16, physical: u16 },
}

/// Logical to physical channel translation, fixed for the life of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMap {
    physical: Vec<u16>,
}

impl ChannelMap {
    pub fn new(count: u16, overrides: &BTreeMap<u16, u16>) -> Result<Self, MapError> {
        if count == 0 {
            return Err(MapError::Empty);
        }

        let mut physical: Vec<u16> = (0..count).collect();
        let mut claimed: BTreeMap<u16, u16> = BTreeMap::new();

        for (&logical, &target) in overrides {
            if logical >= count {
                return Err(MapError::LogicalOutOfRange { logical, count });
            }
            if target >= count {
                return Err(MapError::PhysicalOutOfRange { logical, physical: target, count });
            }
            if let Some(&first) = claimed.get(&target) {
                return Err(MapError::DuplicateOverride { first, second: logical, physical: target });
            }
            claimed.insert(target, logical);
            physical[logical as usize] = target;
        }

        Ok(ChannelMap { physical })
    }

    #[cfg(test)]
    pub fn identity(count: u16) -> Result<Self, MapError> {
        Self::new(count, &BTreeMap::new())
    }

    /// Number of logical channels, which is also the number of storage slots.
    pub fn len(&self) -> usize {
        self.physical.len()
    }

    pub fn physical(&self, logical: u16) -> Option<u16> {
        self.physical.get(logical as usize).copied()
    }

    /// Every physical channel some logical channel points at, ascending and
    /// without repeats.
    pub fn outputs(&self) -> Vec<u16> {
        let set: BTreeSet<u16> = self.physical.iter().copied().collect();
        set.into_iter().collect()
    }
}

pub fn default_overrides() -> BTreeMap<u16, u16> {
    DEFAULT_OVERRIDES.into_iter().collect()
}
