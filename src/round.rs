use rand::rngs::StdRng;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::audio::AudioCue;
use crate::config::{LevelConfig, TrainingConfig};
use crate::escalation::{EscalationPolicy, EscalationProtocol, Step};
use crate::fusion::{Position, PositionThresholds, SensorFusion};
use crate::rig::Rig;
use crate::runtime::Pacer;
use crate::session::{DifficultyLevel, RoundRecord};

/// Extra time a commanded bulb may stay lit when the position is never reached.
const BULB_SAFETY_MARGIN: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundOutcome {
    Completed(RoundRecord),
    Voided(RoundRecord),
    /// Both sensors lost; the partial round is discarded
    SensorLost,
    /// Session deadline reached; the partial round is neither credited nor failed
    DeadlineReached,
}

/// Position bulbs with one pending switch-off.
struct Bulbs<'a> {
    rig: &'a Rig,
    off_at: Option<(Position, Duration)>,
}

impl<'a> Bulbs<'a> {
    fn new(rig: &'a Rig) -> Self {
        Self { rig, off_at: None }
    }

    fn command(&mut self, position: Position, now: Duration, budget: Duration, rapid: bool) {
        let board = &self.rig.switchboard;
        board.bulb(position.opposite(), false);
        if rapid {
            board.bulb(position, false);
            self.off_at = None;
        } else {
            board.bulb(position, true);
            self.off_at = Some((position, now + budget + BULB_SAFETY_MARGIN));
        }
    }

    /// Lights the bulb for the confirmation period; in rapid mode this is a blink.
    fn confirm(&mut self, position: Position, now: Duration, period: Duration) {
        self.rig.switchboard.bulb(position, true);
        self.off_at = Some((position, now + period));
    }

    fn tick(&mut self, now: Duration) {
        if let Some((position, at)) = self.off_at {
            if now >= at {
                self.rig.switchboard.bulb(position, false);
                self.off_at = None;
            }
        }
    }

    fn all_off(&mut self) {
        self.rig.switchboard.all_bulbs(false);
        self.off_at = None;
    }
}

/// Runs one round from the initial DOWN check to completion, void, sensor
/// loss or the session deadline.
pub struct RoundController<'a> {
    config: &'a TrainingConfig,
    rig: &'a Rig,
    fusion: &'a mut SensorFusion,
    rng: &'a mut StdRng,
    deadline: Duration,
    rapid: bool,
}

impl<'a> RoundController<'a> {
    pub fn new(
        config: &'a TrainingConfig,
        rig: &'a Rig,
        fusion: &'a mut SensorFusion,
        rng: &'a mut StdRng,
        deadline: Duration,
    ) -> Self {
        Self {
            config,
            rig,
            fusion,
            rng,
            deadline,
            rapid: false,
        }
    }

    /// Rapid drills use a fixed short budget and silent violations.
    pub fn rapid(mut self, rapid: bool) -> Self {
        self.rapid = rapid;
        self
    }

    fn thresholds(&self) -> PositionThresholds {
        PositionThresholds {
            down_below: self.config.sensors.down_below_deg,
            up_above: self.config.sensors.up_above_deg,
        }
    }

    fn hold_target(&mut self, level: &LevelConfig, position: Position) -> Duration {
        match position {
            Position::Up => level.hold_time_up.sample(&mut *self.rng),
            Position::Down => level.hold_time_down.sample(&mut *self.rng),
        }
    }

    fn transition_budget(&mut self, level: &LevelConfig) -> Duration {
        if self.rapid {
            self.config.rapid_transition()
        } else {
            level.transition_time.sample(&mut *self.rng)
        }
    }

    pub fn run(&mut self, level: DifficultyLevel) -> RoundOutcome {
        let level_cfg = *self.config.levels.get(level);
        let duration = level_cfg.round_duration.sample_whole_secs(&mut *self.rng);
        info!(%level, duration_secs = duration.as_secs(), "round starting");

        let mut bulbs = Bulbs::new(self.rig);
        let confirmation = self.config.position_confirmation();
        let thresholds = self.thresholds();

        let start = self.rig.now();
        bulbs.command(Position::Down, start, level_cfg.transition_time.max_duration(), false);
        self.rig.play(AudioCue::command(Position::Down));

        if let Some(outcome) = self.await_initial_down(&thresholds) {
            bulbs.all_off();
            return outcome;
        }

        let started = self.rig.now();
        bulbs.confirm(Position::Down, started, confirmation);
        info!("initial DOWN verified, round clock running");

        let mut protocol = EscalationProtocol::new(EscalationPolicy {
            ceiling: self.config.violation_ceiling,
            cadence: self.config.restimulate_interval(),
        });
        let initial_budget = self.transition_budget(&level_cfg);
        protocol.begin_held(Position::Down, started, initial_budget);
        let mut hold_target = self.hold_target(&level_cfg, Position::Down);
        let mut violation_time = Duration::ZERO;

        let record = |violations: u32, voided: bool| RoundRecord {
            level,
            duration,
            violations,
            voided,
        };

        let pacer = Pacer::from_hz(self.config.polling.achievement_hz);
        loop {
            let now = self.rig.now();

            let snapshot = self.rig.poll_sensors(self.fusion);
            if snapshot.both_lost {
                warn!(
                    violations = protocol.round_violations(),
                    "sensors lost mid-round, round discarded"
                );
                bulbs.all_off();
                return RoundOutcome::SensorLost;
            }

            let target = protocol.target().unwrap_or(Position::Down);
            let in_position = snapshot
                .angle
                .is_some_and(|angle| thresholds.matches(target, angle));

            match protocol.observe(now, in_position) {
                Step::Waiting | Step::Slipped | Step::Regained => {}
                Step::Achieved { violation_time: v } => {
                    violation_time += v;
                    hold_target = self.hold_target(&level_cfg, target);
                    bulbs.confirm(target, now, confirmation);
                    debug!(
                        position = %target,
                        hold_secs = hold_target.as_secs_f64(),
                        "position achieved"
                    );
                }
                Step::Corrected { violation_time: v } => {
                    violation_time += v;
                    bulbs.confirm(target, now, confirmation);
                    info!(position = %target, violation_secs = v.as_secs_f64(), "position corrected");
                }
                Step::Violation { announce } => {
                    self.rig.shock(&mut *self.rng, &self.config.stimulus);
                    if announce {
                        self.rig.play(AudioCue::Violation);
                    }
                }
                Step::Restimulate { consecutive } => {
                    debug!(consecutive, "re-stimulating");
                    self.rig.shock(&mut *self.rng, &self.config.stimulus);
                }
                Step::Void => {
                    self.rig.shock(&mut *self.rng, &self.config.stimulus);
                    self.rig.play(AudioCue::TenInRow);
                    bulbs.all_off();
                    warn!(%level, "round voided");
                    return RoundOutcome::Voided(record(protocol.round_violations(), true));
                }
            }
            bulbs.tick(now);

            if protocol.is_holding() && protocol.held_for(now) >= hold_target {
                let next = target.opposite();
                let budget = self.transition_budget(&level_cfg);
                protocol.begin(next, now, budget, self.rapid);
                bulbs.command(next, now, budget, self.rapid);
                self.rig.play(AudioCue::command(next));
                debug!(position = %next, budget_secs = budget.as_secs_f64(), "position commanded");
            }

            let excluded = violation_time + protocol.ongoing_violation(now);
            let progress = now.saturating_sub(started).saturating_sub(excluded);
            if progress >= duration {
                bulbs.all_off();
                self.rig.vibrate(&self.config.stimulus);
                info!(
                    %level,
                    violations = protocol.round_violations(),
                    violation_secs = violation_time.as_secs_f64(),
                    "round complete"
                );
                return RoundOutcome::Completed(record(protocol.round_violations(), false));
            }
            if now >= self.deadline {
                bulbs.all_off();
                info!("session deadline reached mid-round");
                return RoundOutcome::DeadlineReached;
            }

            pacer.pause(self.rig.clock.as_ref());
        }
    }

    /// Blocks at the phase rate until DOWN is confirmed; `Some` on an escape.
    fn await_initial_down(&mut self, thresholds: &PositionThresholds) -> Option<RoundOutcome> {
        let pacer = Pacer::from_hz(self.config.polling.phase_hz);
        loop {
            let snapshot = self.rig.poll_sensors(self.fusion);
            if snapshot.both_lost {
                warn!("sensors lost before the round clock started");
                return Some(RoundOutcome::SensorLost);
            }
            if snapshot
                .angle
                .is_some_and(|angle| thresholds.matches(Position::Down, angle))
            {
                return None;
            }
            if self.rig.now() >= self.deadline {
                return Some(RoundOutcome::DeadlineReached);
            }
            pacer.pause(self.rig.clock.as_ref());
        }
    }
}
