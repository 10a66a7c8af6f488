mod sim;
mod sysfs;
mod writer;

pub use sim::SimulatedPwm;
pub use sysfs::{DEFAULT_CHIP, SysfsPwm};
pub use writer::{DeviceWriter, DutyFrame, PushOutcome};

use std::io;
use std::thread;
use std::time::Duration;

use log::{info, warn};
use thiserror::Error;

use crate::channel_map::ChannelMap;
use crate::store::INTERNAL_MAX;

/// Period written to every output: 1 ms.
pub const DEFAULT_PERIOD_NS: u32 = 1_000_000;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("pwm{0} is not provisioned")]
    Unavailable(u16),
    #[error("pwm{channel}: {source}")]
    Io {
        channel: u16,
        #[source]
        source: io::Error,
    },
    #[error("pwm{channel}: could not parse {what} from {value:?}")]
    Parse {
        channel: u16,
        what: &'static str,
        value: String,
    },
}

/// A bank of PWM outputs addressed by physical channel. Duty cycle and period
/// are both in nanoseconds.
///
/// Duty cycle writes take `&self` so every output can be written from its own
/// thread once setup is done.
pub trait PwmDevice: Send + Sync {
    fn is_provisioned(&self, channel: u16) -> Result<bool, DeviceError>;
    fn provision(&mut self, channel: u16) -> Result<(), DeviceError>;
    fn configure(&mut self, channel: u16, period_ns: u32) -> Result<(), DeviceError>;
    fn enable(&mut self, channel: u16) -> Result<(), DeviceError>;
    fn write_duty_cycle(&self, channel: u16, duty_ns: u32) -> Result<(), DeviceError>;
    fn read_duty_cycle(&self, channel: u16) -> Result<u32, DeviceError>;
    fn read_period(&self, channel: u16) -> Result<u32, DeviceError>;
}

/// Provision, configure and enable every output the map points at.
///
/// Blocks until each channel shows up; there is no timeout. Period and enable
/// failures only cost that one channel.
pub fn initialize(device: &mut dyn PwmDevice, map: &ChannelMap, period_ns: u32, poll: Duration) {
    for channel in map.outputs() {
        match device.is_provisioned(channel) {
            Ok(true) => {}
            Ok(false) => {
                info!("[PWM] exporting pwm{}", channel);
                if let Err(e) = device.provision(channel) {
                    warn!("[PWM] export failed: {}", e);
                }
            }
            Err(e) => warn!("[PWM] {}", e),
        }

        let mut waited = 0u32;
        while !matches!(device.is_provisioned(channel), Ok(true)) {
            waited += 1;
            if waited % 500 == 0 {
                warn!("[PWM] still waiting for pwm{} to appear", channel);
            }
            thread::sleep(poll);
        }

        if let Err(e) = device.configure(channel, period_ns) {
            warn!("[PWM] could not set period: {}", e);
        }
        if let Err(e) = device.enable(channel) {
            warn!("[PWM] could not enable: {}", e);
        }
    }
}

/// Duty cycle on the internal 0..=2040 scale to nanoseconds of `period_ns`.
pub fn duty_ns(internal: u16, period_ns: u32) -> u32 {
    (internal.min(INTERNAL_MAX) as u64 * period_ns as u64 / INTERNAL_MAX as u64) as u32
}

/// Inverse of [`duty_ns`], rounded to the nearest step and clamped.
pub fn internal_from_duty(duty_ns: u32, period_ns: u32) -> Option<u16> {
    if period_ns == 0 {
        return None;
    }
    let period = period_ns as u64;
    let value = (duty_ns as u64 * INTERNAL_MAX as u64 + period / 2) / period;
    Some(value.min(INTERNAL_MAX as u64) as u16)
}

/// Read every mapped output's duty cycle back into internal units, one entry
/// per slot. Slots that cannot be read start at zero.
pub fn read_back(device: &dyn PwmDevice, map: &ChannelMap) -> Vec<u16> {
    let mut values = vec![0u16; map.len()];
    for channel in map.outputs() {
        let read = device
            .read_period(channel)
            .and_then(|period| Ok((device.read_duty_cycle(channel)?, period)));
        match read {
            Ok((duty, period)) => match internal_from_duty(duty, period) {
                Some(value) => values[channel as usize] = value,
                None => warn!("[PWM] pwm{} reports a zero period", channel),
            },
            Err(e) => warn!("[PWM] could not read back: {}", e),
        }
    }
    values
}
