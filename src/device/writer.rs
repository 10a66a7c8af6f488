use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TryRecvError, TrySendError};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};

use super::PwmDevice;

/// Duty cycles for one push, as `(physical channel, duty ns)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DutyFrame {
    pub writes: Vec<(u16, u32)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The device finished the write in time.
    Delivered,
    /// The device is still working on this write.
    TimedOut,
    /// An earlier write to this channel has not finished; this one was not sent.
    Busy,
    /// The channel's writer thread is gone.
    Closed,
}

/// One output's writer thread. Holds at most one write in flight.
struct Lane {
    duty: SyncSender<u32>,
    acks: Receiver<()>,
    in_flight: bool,
}

impl Lane {
    fn spawn(device: Arc<dyn PwmDevice>, channel: u16) -> io::Result<Self> {
        let (duty, rx_duty) = mpsc::sync_channel::<u32>(1);
        let (tx_acks, acks) = mpsc::sync_channel::<()>(1);

        thread::Builder::new()
            .name(format!("pwm{}-writer", channel))
            .spawn(move || {
                for duty_ns in rx_duty {
                    if let Err(e) = device.write_duty_cycle(channel, duty_ns) {
                        warn!("[PWM] duty cycle write failed: {}", e);
                    }
                    if tx_acks.send(()).is_err() {
                        break;
                    }
                }
                debug!("[PWM] pwm{} writer stopped", channel);
            })?;

        Ok(Lane {
            duty,
            acks,
            in_flight: false,
        })
    }

    fn send(&mut self, duty_ns: u32) -> Result<(), PushOutcome> {
        if self.in_flight {
            match self.acks.try_recv() {
                Ok(()) => self.in_flight = false,
                Err(TryRecvError::Empty) => return Err(PushOutcome::Busy),
                Err(TryRecvError::Disconnected) => return Err(PushOutcome::Closed),
            }
        }

        self.duty.try_send(duty_ns).map_err(|e| match e {
            TrySendError::Full(_) => PushOutcome::Busy,
            TrySendError::Disconnected(_) => PushOutcome::Closed,
        })
    }

    fn wait(&mut self, deadline: Instant) -> PushOutcome {
        match self.acks.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            Ok(()) => PushOutcome::Delivered,
            Err(RecvTimeoutError::Timeout) => {
                self.in_flight = true;
                PushOutcome::TimedOut
            }
            Err(RecvTimeoutError::Disconnected) => PushOutcome::Closed,
        }
    }
}

/// Writes duty cycles through one thread per output, so a write that hangs
/// only holds up its own channel, and the fade loop waits at most `timeout`
/// per push.
pub struct DeviceWriter {
    lanes: BTreeMap<u16, Lane>,
    timeout: Duration,
}

impl DeviceWriter {
    pub fn spawn(
        device: Arc<dyn PwmDevice>,
        channels: &[u16],
        timeout: Duration,
    ) -> io::Result<Self> {
        let mut lanes = BTreeMap::new();
        for &channel in channels {
            lanes.insert(channel, Lane::spawn(Arc::clone(&device), channel)?);
        }
        Ok(DeviceWriter { lanes, timeout })
    }

    /// Hand every write to its channel's thread, then wait for all of them
    /// against one shared deadline. Returns one outcome per write, ordered by
    /// channel.
    pub fn push(&mut self, frame: DutyFrame) -> Vec<(u16, PushOutcome)> {
        let mut report = Vec::with_capacity(frame.writes.len());
        let mut sent = Vec::with_capacity(frame.writes.len());

        for (channel, duty_ns) in frame.writes {
            let outcome = match self.lanes.get_mut(&channel) {
                Some(lane) => lane.send(duty_ns),
                None => Err(PushOutcome::Closed),
            };
            match outcome {
                Ok(()) => sent.push(channel),
                Err(outcome) => report.push((channel, outcome)),
            }
        }

        let deadline = Instant::now() + self.timeout;
        for channel in sent {
            if let Some(lane) = self.lanes.get_mut(&channel) {
                report.push((channel, lane.wait(deadline)));
            }
        }

        for &(channel, outcome) in &report {
            if outcome == PushOutcome::Closed {
                self.lanes.remove(&channel);
            }
        }
        report.sort_unstable_by_key(|&(channel, _)| channel);
        report
    }
}
