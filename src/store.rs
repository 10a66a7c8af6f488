use std::sync::{Mutex, MutexGuard, PoisonError};

use log::debug;

use crate::channel_map::ChannelMap;
use crate::error::ControlError;

pub const PUBLIC_MAX: u8 = 255;
/// Internal steps per public step, headroom for fades finer than 0..255.
pub const SCALE: u16 = 8;
pub const INTERNAL_MAX: u16 = PUBLIC_MAX as u16 * SCALE;

pub fn to_internal(public: u8) -> u16 {
    public as u16 * SCALE
}

pub fn to_public(internal: u16) -> u8 {
    (internal.min(INTERNAL_MAX) / SCALE) as u8
}

/// One storage slot, both values on the internal 0..=2040 scale.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Slot {
    pub target: u16,
    pub current: u16,
}

impl Slot {
    pub fn settled(&self) -> bool {
        self.current == self.target
    }
}

/// Public-resolution view of every slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub target: Vec<u8>,
    pub current: Vec<u8>,
}

struct Inner {
    slots: Vec<Slot>,
    fade_speed: u16,
}

/// Target and current duty per slot plus the fade speed, shared between the
/// fade thread and the request handlers.
///
/// Slots are indexed by physical channel; `set_channel` goes through the
/// channel map first.
pub struct ChannelStore {
    map: ChannelMap,
    inner: Mutex<Inner>,
}

impl ChannelStore {
    pub fn new(map: ChannelMap, fade_speed: u16) -> Self {
        let slots = vec![Slot::default(); map.len()];
        ChannelStore {
            map,
            inner: Mutex::new(Inner { slots, fade_speed }),
        }
    }

    pub fn map(&self) -> &ChannelMap {
        &self.map
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start every slot at the given internal value with nothing to fade.
    pub fn seed(&self, values: &[u16]) {
        let mut inner = self.lock();
        for (slot, &value) in inner.slots.iter_mut().zip(values) {
            let value = value.min(INTERNAL_MAX);
            slot.target = value;
            slot.current = value;
        }
    }

    /// Set the target of a logical channel. Returns the slot that was written.
    pub fn set_channel(&self, channel: u32, value: u32) -> Result<u16, ControlError> {
        let count = self.map.len() as u16;
        let physical = u16::try_from(channel)
            .ok()
            .and_then(|logical| self.map.physical(logical))
            .ok_or(ControlError::InvalidChannel { channel, count })?;
        let public = u8::try_from(value).map_err(|_| ControlError::InvalidValue(value))?;

        self.lock().slots[physical as usize].target = to_internal(public);
        debug!("[STORE] channel {} (slot {}) -> {}", channel, physical, public);
        Ok(physical)
    }

    pub fn read_all(&self) -> Snapshot {
        let inner = self.lock();
        Snapshot {
            target: inner.slots.iter().map(|s| to_public(s.target)).collect(),
            current: inner.slots.iter().map(|s| to_public(s.current)).collect(),
        }
    }

    #[cfg(test)]
    pub fn slot(&self, index: usize) -> Option<Slot> {
        self.lock().slots.get(index).copied()
    }

    pub fn set_fade_speed(&self, speed: u64) -> Result<(), ControlError> {
        let speed = u16::try_from(speed).map_err(|_| ControlError::InvalidFadeSpeed(speed))?;
        self.lock().fade_speed = speed;
        Ok(())
    }

    pub fn fade_speed(&self) -> u16 {
        self.lock().fade_speed
    }

    /// Run `f` over all slots with the lock held. Used by the fade engine so a
    /// whole tick is applied under one acquisition.
    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut [Slot], u16) -> R) -> R {
        let mut inner = self.lock();
        let speed = inner.fade_speed;
        f(&mut inner.slots, speed)
    }
}
