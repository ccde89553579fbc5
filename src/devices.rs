use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::fusion::Position;

/// Collaborator-side failure. Only ever logged, never propagated into phase logic.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DeviceError {
    #[error("device unreachable: {0}")]
    Unreachable(String),
    #[error("device rejected request with status {0}")]
    Rejected(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Relay {
    DownBulb,
    UpBulb,
    Strobe,
    Fan,
    Heater,
    DonePlug,
}

impl Relay {
    pub const ALL: [Relay; 6] = [
        Relay::DownBulb,
        Relay::UpBulb,
        Relay::Strobe,
        Relay::Fan,
        Relay::Heater,
        Relay::DonePlug,
    ];

    pub fn bulb_for(position: Position) -> Relay {
        match position {
            Position::Down => Relay::DownBulb,
            Position::Up => Relay::UpBulb,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Button {
    /// Break extension request; also starts the session
    Extension,
    /// Reserved for rapid drills
    Rapid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Relay(Relay),
    Button(Button),
    Emitter,
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Device::Relay(r) => write!(f, "relay:{r}"),
            Device::Button(b) => write!(f, "button:{b}"),
            Device::Emitter => write!(f, "emitter"),
        }
    }
}

impl Device {
    pub fn all() -> Vec<Device> {
        Relay::ALL
            .iter()
            .map(|r| Device::Relay(*r))
            .chain([
                Device::Button(Button::Extension),
                Device::Button(Button::Rapid),
                Device::Emitter,
            ])
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum SensorId {
    Primary,
    Backup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Latest state of one angle source as reported by the sensor driver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorReading {
    pub angle: Option<i32>,
    pub state: ConnectionState,
    /// Arrival time of the latest sample, on the session clock
    pub last_update: Option<Duration>,
}

impl SensorReading {
    pub fn disconnected() -> Self {
        Self {
            angle: None,
            state: ConnectionState::Disconnected,
            last_update: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum StimulusMode {
    Shock,
    Vibrate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stimulus {
    pub mode: StimulusMode,
    pub intensity: u8,
    pub duration_secs: u8,
}

pub trait AngleSource: Send {
    fn read(&self, sensor: SensorId) -> SensorReading;
}

/// Idempotent relay switch; retries internally and reports success only.
pub trait RelayControl: Send + Sync {
    fn set_state(&self, relay: Relay, on: bool) -> bool;
}

/// Monotonically increasing press counters; `None` when unreachable.
pub trait ButtonPanel: Send {
    fn read_counter(&self, button: Button) -> Option<u64>;
}

pub trait Stimulator: Send + Sync {
    fn stimulate(&self, stimulus: Stimulus) -> Result<(), DeviceError>;
}

/// Per-device online flags. Written by the reconnection monitor only.
#[derive(Debug)]
pub struct HardwareStatus {
    online: HashMap<Device, AtomicBool>,
}

impl HardwareStatus {
    pub fn new() -> Self {
        Self {
            online: Device::all()
                .into_iter()
                .map(|d| (d, AtomicBool::new(true)))
                .collect(),
        }
    }

    pub fn is_online(&self, device: Device) -> bool {
        self.online
            .get(&device)
            .map(|f| f.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Records a reachability check; returns true when the flag changed.
    pub fn mark(&self, device: Device, online: bool) -> bool {
        match self.online.get(&device) {
            Some(flag) => flag.swap(online, Ordering::AcqRel) != online,
            None => false,
        }
    }

    pub fn offline(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self
            .online
            .iter()
            .filter(|(_, f)| !f.load(Ordering::Acquire))
            .map(|(d, _)| *d)
            .collect();
        devices.sort_by_key(|d| d.to_string());
        devices
    }
}

impl Default for HardwareStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Relay facade used by the session loop.
///
/// A failed switch is retried once only while the monitor still reports the
/// device online; offline devices are left to the monitor.
#[derive(Clone)]
pub struct Switchboard {
    relays: Arc<dyn RelayControl>,
    status: Arc<HardwareStatus>,
}

impl Switchboard {
    pub fn new(relays: Arc<dyn RelayControl>, status: Arc<HardwareStatus>) -> Self {
        Self { relays, status }
    }

    pub fn status(&self) -> &Arc<HardwareStatus> {
        &self.status
    }

    pub fn set(&self, relay: Relay, on: bool) -> bool {
        if self.relays.set_state(relay, on) {
            return true;
        }
        if self.status.is_online(Device::Relay(relay)) {
            debug!(%relay, on, "relay switch failed, retrying");
            if self.relays.set_state(relay, on) {
                return true;
            }
            warn!(%relay, on, "relay switch failed twice");
        } else {
            debug!(%relay, on, "relay offline, switch skipped");
        }
        false
    }

    pub fn all_bulbs(&self, on: bool) {
        self.set(Relay::DownBulb, on);
        self.set(Relay::UpBulb, on);
    }

    pub fn bulb(&self, position: Position, on: bool) -> bool {
        self.set(Relay::bulb_for(position), on)
    }
}

/// Rising-edge detector over a press counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PressDetector {
    last: Option<u64>,
}

impl PressDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// True on a fresh press. The first reading only sets the baseline and an
    /// unreachable button keeps the previous one.
    pub fn update(&mut self, reading: Option<u64>) -> bool {
        let Some(current) = reading else {
            return false;
        };
        let pressed = self.last.is_some_and(|last| current > last);
        self.last = Some(current);
        pressed
    }

    pub fn rebase(&mut self, reading: Option<u64>) {
        if reading.is_some() {
            self.last = reading;
        }
    }
}
