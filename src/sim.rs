//! In-process rig: a scripted subject, two board sensors, relays, buttons,
//! audio and stimulator, all on one [`ManualClock`].

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::audio::{AudioCue, AudioPlayer};
use crate::devices::{
    AngleSource, Button, ButtonPanel, ConnectionState, Device, DeviceError, HardwareStatus, Relay,
    RelayControl, SensorId, SensorReading, Stimulator, Stimulus, Switchboard,
};
use crate::dispatch::StimulusDispatcher;
use crate::fusion::Position;
use crate::monitor::DeviceCheck;
use crate::rig::Rig;
use crate::runtime::{Clock, ManualClock};

const DOWN_ANGLE: i32 = 5;
const UP_ANGLE: i32 = 90;
/// Between the bands: matches neither position
const LAPSE_ANGLE: i32 = 50;
const CUE_LENGTH: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SimEvent {
    Cue { at: Duration, cue: AudioCue },
    Stimulus { at: Duration, stimulus: Stimulus },
    Relay { at: Duration, relay: Relay, on: bool },
    Ambient { at: Duration, on: bool },
}

#[derive(Debug, Clone, Copy)]
struct Window {
    from: Duration,
    until: Duration,
}

impl Window {
    fn contains(&self, t: Duration) -> bool {
        t >= self.from && t < self.until
    }
}

#[derive(Debug, Default)]
struct WorldState {
    reaction: Duration,
    refuse: Option<Position>,
    lapses: Vec<Window>,
    periodic_lapse: Option<(Duration, Duration)>,
    outages: Vec<(SensorId, Window)>,
    presses: Vec<(Duration, Button)>,
    cue_presses: Vec<(AudioCue, Duration, Button)>,
    failing: Vec<Relay>,
    fault: Option<AudioCue>,
    sensor_fault: bool,
    commanded: Option<(Position, Duration)>,
    relays: HashMap<Relay, bool>,
    ambient: bool,
    events: Vec<SimEvent>,
}

impl WorldState {
    fn in_lapse(&self, t: Duration) -> bool {
        if self.lapses.iter().any(|w| w.contains(t)) {
            return true;
        }
        match self.periodic_lapse {
            Some((every, length)) if !every.is_zero() => {
                let phase = t.as_micros() % every.as_micros();
                t >= every && phase < length.as_micros()
            }
            _ => false,
        }
    }

    fn subject_angle(&self, t: Duration) -> i32 {
        if self.in_lapse(t) {
            return LAPSE_ANGLE;
        }
        let position = match self.commanded {
            None => Position::Down,
            Some((target, at)) if t.saturating_sub(at) >= self.reaction => target,
            Some((target, _)) => target.opposite(),
        };
        if self.refuse == Some(position) {
            return LAPSE_ANGLE;
        }
        match position {
            Position::Down => DOWN_ANGLE,
            Position::Up => UP_ANGLE,
        }
    }
}

/// Shared simulated world. Cloning shares the same state and clock.
#[derive(Clone, Default)]
pub struct SimWorld {
    state: Arc<Mutex<WorldState>>,
    clock: ManualClock,
}

impl SimWorld {
    pub fn new() -> Self {
        let world = Self::default();
        world.lock().reaction = Duration::from_secs(1);
        world
    }

    // An injected fault panics inside `play`; later readers must still get in.
    fn lock(&self) -> MutexGuard<'_, WorldState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn clock(&self) -> ManualClock {
        self.clock.clone()
    }

    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    /// Builds a rig wired to this world with an inline stimulus dispatcher.
    pub fn rig(&self) -> Rig {
        self.rig_with_status(Arc::new(HardwareStatus::new()))
    }

    pub fn rig_with_status(&self, status: Arc<HardwareStatus>) -> Rig {
        self.wire(status, StimulusDispatcher::inline(Arc::new(self.clone())))
    }

    /// Like [`rig_with_status`](Self::rig_with_status), but stimuli go through
    /// a worker thread the way a live rig sends them.
    pub fn threaded_rig(&self, status: Arc<HardwareStatus>) -> io::Result<Rig> {
        let stimulus = StimulusDispatcher::spawn(Arc::new(self.clone()))?;
        Ok(self.wire(status, stimulus))
    }

    fn wire(&self, status: Arc<HardwareStatus>, stimulus: StimulusDispatcher) -> Rig {
        Rig {
            sensors: Box::new(self.clone()),
            switchboard: Switchboard::new(Arc::new(self.clone()), status),
            buttons: Box::new(self.clone()),
            audio: Box::new(self.clone()),
            stimulus,
            clock: Arc::new(self.clock.clone()),
        }
    }

    pub fn device_check(&self) -> Arc<dyn DeviceCheck> {
        Arc::new(self.clone())
    }

    pub fn set_reaction(&self, reaction: Duration) {
        self.lock().reaction = reaction;
    }

    /// The subject never takes this position.
    pub fn refuse(&self, position: Position) {
        self.lock().refuse = Some(position);
    }

    /// The subject drifts out of any position during `[from, until)`.
    pub fn lapse(&self, from: Duration, until: Duration) {
        self.lock().lapses.push(Window { from, until });
    }

    pub fn lapse_every(&self, every: Duration, length: Duration) {
        self.lock().periodic_lapse = Some((every, length));
    }

    pub fn sensor_outage(&self, sensor: SensorId, from: Duration, until: Duration) {
        self.lock().outages.push((sensor, Window { from, until }));
    }

    pub fn press(&self, at: Duration, button: Button) {
        self.lock().presses.push((at, button));
    }

    /// The first time `cue` plays, `button` is pressed `after` it.
    pub fn press_on_cue(&self, cue: AudioCue, after: Duration, button: Button) {
        self.lock().cue_presses.push((cue, after, button));
    }

    pub fn fail_relay(&self, relay: Relay) {
        self.lock().failing.push(relay);
    }

    /// Playing `cue` panics.
    pub fn fault_on(&self, cue: AudioCue) {
        self.lock().fault = Some(cue);
    }

    /// Reading any sensor panics.
    pub fn fault_on_sensors(&self) {
        self.lock().sensor_fault = true;
    }

    pub fn events(&self) -> Vec<SimEvent> {
        self.lock().events.clone()
    }

    pub fn cues(&self) -> Vec<AudioCue> {
        self.lock()
            .events
            .iter()
            .filter_map(|e| match e {
                SimEvent::Cue { cue, .. } => Some(*cue),
                _ => None,
            })
            .collect()
    }

    pub fn stimuli(&self) -> Vec<Stimulus> {
        self.lock()
            .events
            .iter()
            .filter_map(|e| match e {
                SimEvent::Stimulus { stimulus, .. } => Some(*stimulus),
                _ => None,
            })
            .collect()
    }

    pub fn relay_on(&self, relay: Relay) -> bool {
        self.lock().relays.get(&relay).copied().unwrap_or(false)
    }

    pub fn ambient_on(&self) -> bool {
        self.lock().ambient
    }
}

impl AngleSource for SimWorld {
    fn read(&self, sensor: SensorId) -> SensorReading {
        let now = self.clock.now();
        let state = self.lock();
        if state.sensor_fault {
            drop(state);
            panic!("injected sensor fault on {sensor}");
        }
        if state
            .outages
            .iter()
            .any(|(s, w)| *s == sensor && w.contains(now))
        {
            return SensorReading::disconnected();
        }
        SensorReading {
            angle: Some(state.subject_angle(now)),
            state: ConnectionState::Connected,
            last_update: Some(now),
        }
    }
}

impl RelayControl for SimWorld {
    fn set_state(&self, relay: Relay, on: bool) -> bool {
        let at = self.clock.now();
        let mut state = self.lock();
        if state.failing.contains(&relay) {
            return false;
        }
        state.relays.insert(relay, on);
        state.events.push(SimEvent::Relay { at, relay, on });
        true
    }
}

impl ButtonPanel for SimWorld {
    fn read_counter(&self, button: Button) -> Option<u64> {
        let now = self.clock.now();
        let count = self
            .lock()
            .presses
            .iter()
            .filter(|(at, b)| *b == button && *at <= now)
            .count();
        Some(count as u64)
    }
}

impl AudioPlayer for SimWorld {
    fn play(&self, cue: AudioCue) -> Duration {
        let at = self.clock.now();
        let fault = {
            let mut state = self.lock();
            state.events.push(SimEvent::Cue { at, cue });
            match cue {
                AudioCue::PositionDown => state.commanded = Some((Position::Down, at)),
                AudioCue::PositionUp => state.commanded = Some((Position::Up, at)),
                _ => {}
            }
            if let Some(i) = state.cue_presses.iter().position(|(c, _, _)| *c == cue) {
                let (_, after, button) = state.cue_presses.remove(i);
                state.presses.push((at + after, button));
            }
            state.fault == Some(cue)
        };
        if fault {
            panic!("injected audio fault on {cue}");
        }
        CUE_LENGTH
    }

    fn start_ambient_loop(&self) {
        let at = self.clock.now();
        let mut state = self.lock();
        state.ambient = true;
        state.events.push(SimEvent::Ambient { at, on: true });
    }

    fn stop_ambient_loop(&self) {
        let at = self.clock.now();
        let mut state = self.lock();
        if state.ambient {
            state.ambient = false;
            state.events.push(SimEvent::Ambient { at, on: false });
        }
    }
}

impl Stimulator for SimWorld {
    fn stimulate(&self, stimulus: Stimulus) -> Result<(), DeviceError> {
        let at = self.clock.now();
        self.lock()
            .events
            .push(SimEvent::Stimulus { at, stimulus });
        Ok(())
    }
}

impl DeviceCheck for SimWorld {
    fn is_reachable(&self, device: Device) -> bool {
        match device {
            Device::Relay(relay) => !self.lock().failing.contains(&relay),
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_follows_commands_after_reaction() {
        let world = SimWorld::new();
        let rig = world.rig();
        assert_eq!(world.read(SensorId::Primary).angle, Some(DOWN_ANGLE));
        rig.play(AudioCue::PositionUp);
        world.clock().advance(Duration::from_millis(500));
        assert_eq!(world.read(SensorId::Primary).angle, Some(DOWN_ANGLE));
        world.clock().advance(Duration::from_millis(500));
        assert_eq!(world.read(SensorId::Backup).angle, Some(UP_ANGLE));
    }

    #[test]
    fn outages_and_presses_follow_the_script() {
        let world = SimWorld::new();
        world.sensor_outage(SensorId::Primary, Duration::from_secs(1), Duration::from_secs(3));
        world.press(Duration::from_secs(2), Button::Extension);
        let clock = world.clock();
        clock.set(Duration::from_secs(2));
        assert_eq!(world.read(SensorId::Primary), SensorReading::disconnected());
        assert_eq!(world.read(SensorId::Backup).state, ConnectionState::Connected);
        assert_eq!(world.read_counter(Button::Extension), Some(1));
        assert_eq!(world.read_counter(Button::Rapid), Some(0));
    }

    #[test]
    fn periodic_lapse() {
        let world = SimWorld::new();
        world.lapse_every(Duration::from_secs(100), Duration::from_secs(10));
        let state = world.lock();
        assert!(!state.in_lapse(Duration::from_secs(5)));
        assert!(state.in_lapse(Duration::from_secs(105)));
        assert!(!state.in_lapse(Duration::from_secs(115)));
    }

    #[test]
    fn failing_relay_reports_offline() {
        let world = SimWorld::new();
        world.fail_relay(Relay::Fan);
        assert!(!world.set_state(Relay::Fan, true));
        assert!(!world.is_reachable(Device::Relay(Relay::Fan)));
        assert!(world.set_state(Relay::Heater, true));
        assert!(world.relay_on(Relay::Heater));
    }
}
