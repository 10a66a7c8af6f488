use std::collections::BTreeSet;
use std::io;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::device::{self, DeviceWriter, DutyFrame, PushOutcome};
use crate::store::{ChannelStore, Slot};

pub const DEFAULT_TICK: Duration = Duration::from_millis(30);
pub const DEFAULT_FADE_SPEED: u16 = 100;

/// One convergence step: move `current` toward `target` by at most `speed`,
/// never past it. A speed of zero jumps straight to the target.
pub fn advance(current: u16, target: u16, speed: u16) -> u16 {
    let diff = current.abs_diff(target);
    if speed == 0 {
        return target;
    }
    let step = speed.min(diff);
    if current < target { current + step } else { current - step }
}

/// Apply one step to every slot. Returns whether anything moved.
pub fn step_slots(slots: &mut [Slot], speed: u16) -> bool {
    let mut dirty = false;
    for slot in slots.iter_mut().filter(|s| !s.settled()) {
        slot.current = advance(slot.current, slot.target, speed);
        dirty = true;
    }
    dirty
}

pub struct FadeEngine {
    store: Arc<ChannelStore>,
    outputs: Vec<u16>,
    period_ns: u32,
    // Channels whose latest value has not reached the device.
    pending: BTreeSet<u16>,
    // Channels with a write outstanding past the timeout.
    faulted: BTreeSet<u16>,
}

impl FadeEngine {
    pub fn new(store: Arc<ChannelStore>, period_ns: u32) -> Self {
        let outputs = store.map().outputs();
        FadeEngine {
            store,
            outputs,
            period_ns,
            pending: BTreeSet::new(),
            faulted: BTreeSet::new(),
        }
    }

    /// Advance every slot once. When any slot moved the frame covers every
    /// output; otherwise it only carries channels whose last write never made
    /// it to the device.
    pub fn tick(&mut self) -> Option<DutyFrame> {
        self.store.update(|slots, speed| {
            let channels: Vec<u16> = if step_slots(slots, speed) {
                self.outputs.clone()
            } else {
                self.pending.iter().copied().collect()
            };
            if channels.is_empty() {
                return None;
            }
            let writes = channels
                .into_iter()
                .map(|ch| (ch, device::duty_ns(slots[ch as usize].current, self.period_ns)))
                .collect();
            Some(DutyFrame { writes })
        })
    }

    pub fn push(&mut self, writer: &mut DeviceWriter, frame: DutyFrame) {
        for (channel, outcome) in writer.push(frame) {
            match outcome {
                PushOutcome::Delivered => {
                    self.pending.remove(&channel);
                    if self.faulted.remove(&channel) {
                        info!("[FADE] pwm{} is responding again", channel);
                    }
                }
                PushOutcome::TimedOut => {
                    self.pending.insert(channel);
                    if self.faulted.insert(channel) {
                        warn!("[FADE] pwm{} write timed out, will retry", channel);
                    }
                }
                PushOutcome::Busy => {
                    self.pending.insert(channel);
                    debug!("[FADE] pwm{} still busy, write deferred", channel);
                }
                PushOutcome::Closed => {
                    warn!("[FADE] pwm{} writer has stopped, output dropped", channel);
                    self.pending.remove(&channel);
                    self.faulted.remove(&channel);
                    self.outputs.retain(|&ch| ch != channel);
                }
            }
        }
    }

    /// Run the engine on its own thread, ticking every `tick`.
    pub fn spawn(mut self, mut writer: DeviceWriter, tick: Duration) -> io::Result<FadeHandle> {
        let (stop, stop_rx) = mpsc::channel::<()>();

        let thread = thread::Builder::new().name("fade".into()).spawn(move || {
            info!("[FADE] ticking every {:?}", tick);
            let mut deadline = Instant::now() + tick;
            loop {
                let wait = deadline.saturating_duration_since(Instant::now());
                match stop_rx.recv_timeout(wait) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }

                if let Some(frame) = self.tick() {
                    self.push(&mut writer, frame);
                }

                deadline += tick;
                let now = Instant::now();
                if deadline < now {
                    deadline = now + tick;
                }
            }
            info!("[FADE] stopped");
        })?;

        Ok(FadeHandle {
            stop: Some(stop),
            thread: Some(thread),
        })
    }
}

/// Stops the fade thread when shut down or dropped.
pub struct FadeHandle {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl FadeHandle {
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("[FADE] thread panicked");
            }
        }
    }
}

impl Drop for FadeHandle {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel_map::{ChannelMap, default_overrides};
    use crate::device::{DEFAULT_PERIOD_NS, DeviceError, PwmDevice, SimulatedPwm, initialize};
    use crate::store::{INTERNAL_MAX, to_internal};

    fn engine(speed: u16) -> (Arc<ChannelStore>, FadeEngine) {
        let map = ChannelMap::new(16, &default_overrides()).unwrap();
        let store = Arc::new(ChannelStore::new(map, speed));
        let engine = FadeEngine::new(Arc::clone(&store), DEFAULT_PERIOD_NS);
        (store, engine)
    }

    #[test]
    fn advance_never_overshoots() {
        for (current, target) in [(0u16, 2040u16), (2040, 0), (5, 6), (1000, 999), (17, 1033)] {
            for speed in [1u16, 3, 100, 2040, u16::MAX] {
                let diff = current.abs_diff(target) as u32;
                let bound = diff.div_ceil(speed as u32);
                let mut value = current;
                let mut ticks = 0;
                while value != target {
                    let next = advance(value, target, speed);
                    if value < target {
                        assert!(next > value && next <= target);
                    } else {
                        assert!(next < value && next >= target);
                    }
                    value = next;
                    ticks += 1;
                }
                assert!(ticks <= bound, "{} -> {} at {} took {}", current, target, speed, ticks);
            }
        }
    }

    #[test]
    fn zero_speed_snaps() {
        assert_eq!(advance(0, 2040, 0), 2040);
        assert_eq!(advance(2040, 8, 0), 8);
    }

    #[test]
    fn fades_full_scale_in_21_ticks() {
        let (store, mut engine) = engine(100);
        store.set_channel(0, 255).unwrap();

        assert!(engine.tick().is_some());
        assert_eq!(store.slot(0).unwrap().current, 100);
        assert_eq!(store.read_all().current[0], 12);

        for _ in 1..21 {
            assert!(engine.tick().is_some());
        }
        assert_eq!(store.slot(0).unwrap().current, INTERNAL_MAX);
        assert_eq!(store.read_all().current[0], 255);

        assert_eq!(engine.tick(), None);
        assert_eq!(store.slot(0).unwrap().current, INTERNAL_MAX);
    }

    #[test]
    fn zero_speed_reaches_target_in_one_tick() {
        let (store, mut engine) = engine(100);
        store.set_fade_speed(0).unwrap();
        store.set_channel(3, 10).unwrap();
        store.set_channel(9, 200).unwrap();

        engine.tick();
        assert_eq!(store.slot(3).unwrap().current, 80);
        assert_eq!(store.read_all().current[3], 10);
        assert_eq!(store.slot(10).unwrap().current, to_internal(200));
    }

    #[test]
    fn settled_store_produces_no_frames() {
        let (store, mut engine) = engine(100);
        let mut seed = vec![0u16; 16];
        seed[4] = 800;
        store.seed(&seed);
        for _ in 0..5 {
            assert_eq!(engine.tick(), None);
        }
        assert_eq!(store.slot(4).unwrap().current, 800);
    }

    #[test]
    fn round_trip_after_convergence() {
        let (store, mut engine) = engine(7);
        for v in [0u32, 1, 128, 254, 255] {
            store.set_channel(6, v).unwrap();
            while engine.tick().is_some() {}
            let snapshot = store.read_all();
            assert_eq!(snapshot.current[6] as u32, v);
            assert_eq!(snapshot.target[6] as u32, v);
        }
    }

    #[test]
    fn frame_covers_mapped_outputs() {
        let (store, mut engine) = engine(0);
        store.set_channel(9, 255).unwrap();

        let frame = engine.tick().unwrap();
        assert_eq!(frame.writes.len(), 15);
        assert!(frame.writes.contains(&(10, DEFAULT_PERIOD_NS)));
        assert!(frame.writes.iter().all(|&(ch, _)| ch != 9));
        assert!(frame.writes.iter().filter(|&&(ch, _)| ch != 10).all(|&(_, duty)| duty == 0));
    }

    /// Delegates to a simulated bank but panics on writes to one channel,
    /// which takes that channel's writer thread down.
    struct PanicsOn {
        channel: u16,
        inner: SimulatedPwm,
    }

    impl PwmDevice for PanicsOn {
        fn is_provisioned(&self, channel: u16) -> Result<bool, DeviceError> {
            self.inner.is_provisioned(channel)
        }
        fn provision(&mut self, channel: u16) -> Result<(), DeviceError> {
            self.inner.provision(channel)
        }
        fn configure(&mut self, channel: u16, period_ns: u32) -> Result<(), DeviceError> {
            self.inner.configure(channel, period_ns)
        }
        fn enable(&mut self, channel: u16) -> Result<(), DeviceError> {
            self.inner.enable(channel)
        }
        fn write_duty_cycle(&self, channel: u16, duty_ns: u32) -> Result<(), DeviceError> {
            if channel == self.channel {
                panic!("pwm{} unplugged", channel);
            }
            self.inner.write_duty_cycle(channel, duty_ns)
        }
        fn read_duty_cycle(&self, channel: u16) -> Result<u32, DeviceError> {
            self.inner.read_duty_cycle(channel)
        }
        fn read_period(&self, channel: u16) -> Result<u32, DeviceError> {
            self.inner.read_period(channel)
        }
    }

    fn initialized(map: &ChannelMap) -> SimulatedPwm {
        let mut device = SimulatedPwm::new();
        initialize(&mut device, map, DEFAULT_PERIOD_NS, Duration::from_millis(1));
        device
    }

    #[test]
    fn undelivered_write_is_retried() {
        let (store, mut engine) = engine(0);
        let map = ChannelMap::new(16, &default_overrides()).unwrap();
        let device = initialized(&map);
        let state = device.state();
        state.lock().unwrap().delays.insert(1, Duration::from_millis(100));
        let mut writer =
            DeviceWriter::spawn(Arc::new(device), &map.outputs(), Duration::from_millis(50)).unwrap();

        store.set_channel(1, 50).unwrap();
        let frame = engine.tick().unwrap();
        engine.push(&mut writer, frame);

        // nothing moves any more, but the device never confirmed channel 1
        let frame = engine.tick().unwrap();
        assert_eq!(frame.writes, vec![(1, device::duty_ns(400, DEFAULT_PERIOD_NS))]);

        state.lock().unwrap().delays.clear();
        thread::sleep(Duration::from_millis(300));
        engine.push(&mut writer, frame);
        assert_eq!(engine.tick(), None);
    }

    #[test]
    fn stopped_writer_drops_its_channel() {
        let (store, mut engine) = engine(0);
        let map = ChannelMap::new(16, &default_overrides()).unwrap();
        let sim = initialized(&map);
        let state = sim.state();
        let device = PanicsOn { channel: 1, inner: sim };
        let mut writer =
            DeviceWriter::spawn(Arc::new(device), &map.outputs(), Duration::from_secs(5)).unwrap();

        store.set_channel(1, 50).unwrap();
        let frame = engine.tick().unwrap();
        engine.push(&mut writer, frame);
        assert!(!engine.outputs.contains(&1));
        assert_eq!(engine.tick(), None);

        store.set_channel(0, 60).unwrap();
        let frame = engine.tick().unwrap();
        assert_eq!(frame.writes.len(), 14);
        assert!(frame.writes.iter().all(|&(ch, _)| ch != 1));
        engine.push(&mut writer, frame);
        assert_eq!(engine.tick(), None);
        assert_eq!(state.lock().unwrap().channels[&0].duty_ns, device::duty_ns(480, DEFAULT_PERIOD_NS));
    }

    fn wait_for_duty(device: &SimulatedPwm, channel: u16, duty: u32) {
        let started = Instant::now();
        while device.read_duty_cycle(channel).unwrap() != duty {
            assert!(started.elapsed() < Duration::from_secs(5), "pwm{} never reached {}", channel, duty);
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn spawned_engine_drives_device_and_stops() {
        let map = ChannelMap::new(16, &default_overrides()).unwrap();
        let device = initialized(&map);
        let state = device.state();
        let observer = device.clone();
        let outputs = map.outputs();

        let store = Arc::new(ChannelStore::new(map, 0));
        let writer = DeviceWriter::spawn(Arc::new(device), &outputs, Duration::from_secs(1)).unwrap();
        let handle = FadeEngine::new(Arc::clone(&store), DEFAULT_PERIOD_NS)
            .spawn(writer, Duration::from_millis(2))
            .unwrap();

        store.set_channel(12, 255).unwrap();
        wait_for_duty(&observer, 13, DEFAULT_PERIOD_NS);
        handle.shutdown();

        assert_eq!(store.slot(13).unwrap().current, INTERNAL_MAX);
        let writes = state.lock().unwrap().writes.len();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(state.lock().unwrap().writes.len(), writes);
    }

    #[test]
    fn hung_channel_does_not_freeze_the_others() {
        let map = ChannelMap::identity(4).unwrap();
        let device = initialized(&map);
        let state = device.state();
        state.lock().unwrap().delays.insert(1, Duration::from_secs(3600));
        let observer = device.clone();

        let store = Arc::new(ChannelStore::new(map, 0));
        let writer =
            DeviceWriter::spawn(Arc::new(device), &[0, 1, 2, 3], Duration::from_millis(20)).unwrap();
        let handle = FadeEngine::new(Arc::clone(&store), DEFAULT_PERIOD_NS)
            .spawn(writer, Duration::from_millis(5))
            .unwrap();

        store.set_channel(0, 100).unwrap();
        wait_for_duty(&observer, 0, device::duty_ns(800, DEFAULT_PERIOD_NS));

        store.set_channel(0, 255).unwrap();
        store.set_channel(2, 255).unwrap();
        wait_for_duty(&observer, 0, DEFAULT_PERIOD_NS);
        wait_for_duty(&observer, 2, DEFAULT_PERIOD_NS);
        handle.shutdown();

        assert_eq!(state.lock().unwrap().channels[&1].duty_ns, 0);
        assert_eq!(store.read_all().current, vec![255, 0, 255, 0]);
    }
}
