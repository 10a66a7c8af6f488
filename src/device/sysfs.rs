use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::{DeviceError, PwmDevice};

pub const DEFAULT_CHIP: &str = "/sys/class/pwm/pwmchip0";

/// Linux sysfs PWM chip (`/sys/class/pwm/pwmchipN`).
#[derive(Debug, Clone)]
pub struct SysfsPwm {
    chip: PathBuf,
}

impl SysfsPwm {
    pub fn new(chip: impl Into<PathBuf>) -> Self {
        SysfsPwm { chip: chip.into() }
    }

    fn channel_dir(&self, channel: u16) -> PathBuf {
        self.chip.join(format!("pwm{}", channel))
    }

    fn attribute(&self, channel: u16, name: &str) -> PathBuf {
        self.channel_dir(channel).join(name)
    }

    fn write(&self, channel: u16, path: &Path, value: &str) -> Result<(), DeviceError> {
        fs::write(path, value).map_err(|e| io_error(channel, e))
    }

    fn read_u32(&self, channel: u16, name: &'static str) -> Result<u32, DeviceError> {
        let content =
            fs::read_to_string(self.attribute(channel, name)).map_err(|e| io_error(channel, e))?;
        content.trim().parse().map_err(|_| DeviceError::Parse {
            channel,
            what: name,
            value: content.trim().to_string(),
        })
    }
}

fn io_error(channel: u16, source: io::Error) -> DeviceError {
    if source.kind() == io::ErrorKind::NotFound {
        DeviceError::Unavailable(channel)
    } else {
        DeviceError::Io { channel, source }
    }
}

impl PwmDevice for SysfsPwm {
    fn is_provisioned(&self, channel: u16) -> Result<bool, DeviceError> {
        self.channel_dir(channel)
            .try_exists()
            .map_err(|source| DeviceError::Io { channel, source })
    }

    fn provision(&mut self, channel: u16) -> Result<(), DeviceError> {
        self.write(channel, &self.chip.join("export"), &channel.to_string())
    }

    fn configure(&mut self, channel: u16, period_ns: u32) -> Result<(), DeviceError> {
        self.write(channel, &self.attribute(channel, "period"), &period_ns.to_string())
    }

    fn enable(&mut self, channel: u16) -> Result<(), DeviceError> {
        self.write(channel, &self.attribute(channel, "enable"), "1")
    }

    fn write_duty_cycle(&self, channel: u16, duty_ns: u32) -> Result<(), DeviceError> {
        self.write(channel, &self.attribute(channel, "duty_cycle"), &duty_ns.to_string())
    }

    fn read_duty_cycle(&self, channel: u16) -> Result<u32, DeviceError> {
        self.read_u32(channel, "duty_cycle")
    }

    fn read_period(&self, channel: u16) -> Result<u32, DeviceError> {
        self.read_u32(channel, "period")
    }
}
