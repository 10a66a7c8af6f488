use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use super::{DeviceError, PwmDevice};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimChannel {
    pub period_ns: u32,
    pub duty_ns: u32,
    pub enabled: bool,
    // Polls left before the channel reports as provisioned.
    lag: u32,
}

#[derive(Debug, Default)]
pub struct SimState {
    pub channels: BTreeMap<u16, SimChannel>,
    /// Channels whose reads and writes fail.
    pub failing: BTreeSet<u16>,
    /// Every successful duty cycle write, in order.
    pub writes: Vec<(u16, u32)>,
    /// Added to every duty cycle write on that channel.
    pub delays: BTreeMap<u16, Duration>,
    provision_lag: u32,
}

/// In-memory PWM bank for running without hardware. The state sits behind a
/// shared handle so it can still be inspected once the device has been moved
/// into the writer thread.
#[derive(Debug, Clone, Default)]
pub struct SimulatedPwm {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedPwm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report each channel as missing for `polls` checks after it was
    /// provisioned, like a sysfs export that takes a moment to appear.
    #[cfg(test)]
    pub fn with_provision_lag(self, polls: u32) -> Self {
        self.lock().provision_lag = polls;
        self
    }

    #[cfg(test)]
    pub fn state(&self) -> Arc<Mutex<SimState>> {
        Arc::clone(&self.state)
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_channel<R>(
        &self,
        channel: u16,
        f: impl FnOnce(&mut SimChannel) -> R,
    ) -> Result<R, DeviceError> {
        let mut state = self.lock();
        if state.failing.contains(&channel) {
            return Err(DeviceError::Io {
                channel,
                source: std::io::Error::other("simulated failure"),
            });
        }
        match state.channels.get_mut(&channel) {
            Some(ch) if ch.lag == 0 => Ok(f(ch)),
            _ => Err(DeviceError::Unavailable(channel)),
        }
    }
}

impl PwmDevice for SimulatedPwm {
    fn is_provisioned(&self, channel: u16) -> Result<bool, DeviceError> {
        let mut state = self.lock();
        Ok(match state.channels.get_mut(&channel) {
            Some(ch) if ch.lag > 0 => {
                ch.lag -= 1;
                false
            }
            Some(_) => true,
            None => false,
        })
    }

    fn provision(&mut self, channel: u16) -> Result<(), DeviceError> {
        let mut state = self.lock();
        let lag = state.provision_lag;
        state.channels.entry(channel).or_insert(SimChannel { lag, ..Default::default() });
        Ok(())
    }

    fn configure(&mut self, channel: u16, period_ns: u32) -> Result<(), DeviceError> {
        self.with_channel(channel, |ch| ch.period_ns = period_ns)
    }

    fn enable(&mut self, channel: u16) -> Result<(), DeviceError> {
        self.with_channel(channel, |ch| ch.enabled = true)
    }

    fn write_duty_cycle(&self, channel: u16, duty_ns: u32) -> Result<(), DeviceError> {
        let delay = self.lock().delays.get(&channel).copied();
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        self.with_channel(channel, |ch| ch.duty_ns = duty_ns)?;
        self.lock().writes.push((channel, duty_ns));
        Ok(())
    }

    fn read_duty_cycle(&self, channel: u16) -> Result<u32, DeviceError> {
        self.with_channel(channel, |ch| ch.duty_ns)
    }

    fn read_period(&self, channel: u16) -> Result<u32, DeviceError> {
        self.with_channel(channel, |ch| ch.period_ns)
    }
}
