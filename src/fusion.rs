use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info};

use crate::devices::{AngleSource, ConnectionState, SensorId, SensorReading};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum Position {
    Down,
    Up,
}

impl Position {
    pub fn opposite(self) -> Self {
        match self {
            Position::Down => Position::Up,
            Position::Up => Position::Down,
        }
    }
}

/// Board-angle bands for each position. Angles between the bands match neither.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionThresholds {
    pub down_below: i32,
    pub up_above: i32,
}

impl PositionThresholds {
    pub fn matches(&self, position: Position, angle: i32) -> bool {
        match position {
            Position::Down => angle < self.down_below,
            Position::Up => angle > self.up_above,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FusionEvent {
    SwitchedToBackup,
    SwitchedToPrimary,
    /// Primary is back after both sources were unavailable; backup-only
    /// service does not count as recovery
    AngleRestored,
    /// Falling edge of overall availability
    BothLost,
    /// Rising edge of overall availability
    Recovered { lost_for: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum LossEdge {
    Available,
    Lost { since: Duration },
}

/// One poll's view of the board sensors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorSnapshot {
    pub angle: Option<i32>,
    pub both_lost: bool,
}

/// Freshest board angle from two sources with primary preference, failover
/// and debounced "both lost" edges.
///
/// Edge transitions are queued as [`FusionEvent`]s and drained by the caller,
/// so repeated polling never repeats a side effect.
#[derive(Debug)]
pub struct SensorFusion {
    staleness: Duration,
    active: SensorId,
    angle_lost: bool,
    loss: LossEdge,
    events: Vec<FusionEvent>,
}

impl SensorFusion {
    pub fn new(staleness: Duration) -> Self {
        Self {
            staleness,
            active: SensorId::Primary,
            angle_lost: false,
            loss: LossEdge::Available,
            events: Vec::new(),
        }
    }

    pub fn active_source(&self) -> SensorId {
        self.active
    }

    pub fn is_lost(&self) -> bool {
        matches!(self.loss, LossEdge::Lost { .. })
    }

    pub fn lost_since(&self) -> Option<Duration> {
        match self.loss {
            LossEdge::Lost { since } => Some(since),
            LossEdge::Available => None,
        }
    }

    /// Connected, fresh and carrying an angle.
    pub fn is_available(&self, reading: &SensorReading, now: Duration) -> bool {
        reading.state == ConnectionState::Connected
            && reading.angle.is_some()
            && reading
                .last_update
                .is_some_and(|t| now.saturating_sub(t) < self.staleness)
    }

    pub fn current_angle(&mut self, source: &dyn AngleSource, now: Duration) -> Option<i32> {
        let primary = source.read(SensorId::Primary);
        if self.is_available(&primary, now) {
            if self.active != SensorId::Primary {
                info!("primary sensor back, switching from backup");
                self.active = SensorId::Primary;
                self.events.push(FusionEvent::SwitchedToPrimary);
            }
            self.restore_angle();
            return primary.angle;
        }

        let backup = source.read(SensorId::Backup);
        if self.is_available(&backup, now) {
            if self.active != SensorId::Backup {
                info!("switched to backup board sensor");
                self.active = SensorId::Backup;
                self.events.push(FusionEvent::SwitchedToBackup);
            }
            return backup.angle;
        }

        self.angle_lost = true;
        None
    }

    fn restore_angle(&mut self) {
        if self.angle_lost {
            self.angle_lost = false;
            self.events.push(FusionEvent::AngleRestored);
        }
    }

    pub fn both_sensors_lost(&mut self, source: &dyn AngleSource, now: Duration) -> bool {
        let lost = !self.is_available(&source.read(SensorId::Primary), now)
            && !self.is_available(&source.read(SensorId::Backup), now);
        match (self.loss, lost) {
            (LossEdge::Available, true) => {
                error!("both board sensors lost, patience timer started");
                self.loss = LossEdge::Lost { since: now };
                self.events.push(FusionEvent::BothLost);
            }
            (LossEdge::Lost { since }, false) => {
                let lost_for = now.saturating_sub(since);
                info!(lost_for_secs = lost_for.as_secs_f64(), "board sensors reconnected");
                self.loss = LossEdge::Available;
                self.events.push(FusionEvent::Recovered { lost_for });
            }
            _ => {}
        }
        lost
    }

    /// Angle first, then the loss edge, as one poll.
    pub fn observe(&mut self, source: &dyn AngleSource, now: Duration) -> SensorSnapshot {
        let angle = self.current_angle(source, now);
        let both_lost = self.both_sensors_lost(source, now);
        SensorSnapshot { angle, both_lost }
    }

    pub fn drain_events(&mut self) -> Vec<FusionEvent> {
        std::mem::take(&mut self.events)
    }
}
