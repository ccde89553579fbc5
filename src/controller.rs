use chrono::Local;
use rand::rngs::StdRng;
use serde::Serialize;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::audio::AudioCue;
use crate::config::{secs, ConfigError, TrainingConfig};
use crate::devices::{Button, PressDetector, Relay};
use crate::extension::{ExtensionPool, RequestDecision};
use crate::fusion::SensorFusion;
use crate::rest::{run_extension, BreakController, BreakOutcome, ExtensionEnd};
use crate::rig::Rig;
use crate::round::{RoundController, RoundOutcome};
use crate::runtime::Pacer;
use crate::safety::{EndSequence, FailSafe, SafetyGuard};
use crate::session::{DifficultyLevel, Progress, SessionState, TrainingLedger};

const EXTENSION_CUE_GAP: Duration = Duration::from_secs(1);
const VOID_BREAK_POLL: Duration = Duration::from_secs(1);
const VOID_BREAK_LOG_EVERY: Duration = Duration::from_secs(30);
const SENSOR_WAIT_LOG_EVERY: Duration = Duration::from_secs(300);
const STIMULUS_DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("no board sensor became available within {0:?}")]
    SensorsUnavailable(Duration),
    #[error("session loop panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum_macros::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EndReason {
    GoalAchieved,
    DeadlineReached,
    SensorTimeout,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionReport {
    pub state: SessionState,
    pub reason: Option<EndReason>,
    pub completed_secs: u64,
    pub goal_secs: u64,
    pub rounds_played: u32,
    pub rounds_voided: u32,
    pub cycles_completed: u32,
    pub level: DifficultyLevel,
    pub extension_used_secs: u64,
    pub extension_requests: u32,
    pub stimuli_dispatched: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitStart,
    Preparation,
    Round,
    Break { passed: bool },
    VoidBreak,
    SensorLoss,
    Finish(EndReason),
    Finished,
}

/// Top-level session driver.
///
/// Each [`step`](Self::step) runs the current phase to its next transition.
/// A panic inside a phase sets a sticky critical flag; from then on every
/// step re-asserts the fail-safe hardware state and never leaves Emergency.
pub struct SessionController {
    config: TrainingConfig,
    rig: Rig,
    rng: StdRng,
    fusion: SensorFusion,
    progress: Progress,
    pool: ExtensionPool,
    end_sequence: EndSequence,
    state: SessionState,
    phase: Phase,
    start_button: PressDetector,
    started_at: Option<Duration>,
    deadline: Duration,
    critical: bool,
    failure: Option<String>,
    end_reason: Option<EndReason>,
}

impl SessionController {
    pub fn new(config: TrainingConfig, rig: Rig, mut rng: StdRng) -> Result<Self, SessionError> {
        config.validate()?;
        let goal = config.training_goal.sample_whole_secs(&mut rng);
        let ledger = TrainingLedger::new(goal, config.training_cap());
        info!(
            goal_mins = goal.as_secs_f64() / 60.0,
            cap_mins = config.training_cap().as_secs_f64() / 60.0,
            "training goal drawn"
        );
        let end_sequence = EndSequence::new(
            config.end_signal_delay.sample(&mut rng),
            secs(config.polling.end_refresh_secs),
        );
        Ok(Self {
            progress: Progress::new(ledger, config.cycle_bonus()),
            pool: ExtensionPool::new(
                config.extension_pool(),
                config.min_grantable(),
                config.request_cooldown(),
            ),
            fusion: SensorFusion::new(config.staleness()),
            end_sequence,
            state: SessionState::Waiting,
            phase: Phase::AwaitStart,
            start_button: PressDetector::new(),
            started_at: None,
            deadline: Duration::MAX,
            critical: false,
            failure: None,
            end_reason: None,
            config,
            rig,
            rng,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    pub fn extension_pool(&self) -> &ExtensionPool {
        &self.pool
    }

    pub fn rig(&self) -> &Rig {
        &self.rig
    }

    pub fn is_critical(&self) -> bool {
        self.critical
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn started_at(&self) -> Option<Duration> {
        self.started_at
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.started_at.map(|_| self.deadline)
    }

    pub fn end_reason(&self) -> Option<EndReason> {
        self.end_reason
    }

    pub fn report(&self) -> SessionReport {
        let ledger = self.progress.ledger();
        SessionReport {
            state: self.state,
            reason: self.end_reason,
            completed_secs: ledger.completed().as_secs(),
            goal_secs: ledger.current_goal().as_secs(),
            rounds_played: self.progress.rounds_played(),
            rounds_voided: self.progress.rounds_voided(),
            cycles_completed: self.progress.cycles_completed(),
            level: self.progress.level(),
            extension_used_secs: self.pool.used().as_secs(),
            extension_requests: self.pool.requests(),
            stimuli_dispatched: self.rig.stimulus.dispatched(),
        }
    }

    /// Blocks until a board angle is available or the startup window passes.
    pub fn wait_for_sensors(&mut self) -> Result<(), SessionError> {
        let window = self.config.startup_timeout();
        let pacer = Pacer::from_hz(self.config.polling.phase_hz);
        let since = self.rig.now();
        info!(window_secs = window.as_secs_f64(), "waiting for board sensors");
        loop {
            if let Some(angle) = self.rig.poll_sensors(&mut self.fusion).angle {
                info!(angle, sensor = %self.fusion.active_source(), "board sensor ready");
                return Ok(());
            }
            if self.rig.now().saturating_sub(since) >= window {
                error!("no board sensor available, session cannot start");
                return Err(SessionError::SensorsUnavailable(window));
            }
            pacer.pause(self.rig.clock.as_ref());
        }
    }

    /// Runs until the session finishes and the done signal is active.
    /// Never returns once Emergency is entered.
    ///
    /// On return the lights and done plug are on; callers that keep the
    /// process alive hold them with [`refresh_end_state`](Self::refresh_end_state).
    pub fn run(&mut self) -> Result<SessionReport, SessionError> {
        let mut guard = SafetyGuard::new(self.rig.switchboard.clone());
        if let Err(err) = self.wait_for_sensors() {
            guard.disarm();
            return Err(err);
        }
        let pacer = Pacer::from_hz(self.config.polling.session_hz);
        while self.step() != SessionState::Finished {
            pacer.pause(self.rig.clock.as_ref());
        }
        if !self.rig.stimulus.shutdown(STIMULUS_DRAIN_GRACE) {
            warn!(
                grace_secs = STIMULUS_DRAIN_GRACE.as_secs(),
                "stimulus queue did not drain"
            );
        }
        self.end_sequence
            .activate_after_delay(&self.rig.switchboard, self.rig.clock.as_ref());
        guard.disarm();
        Ok(self.report())
    }

    /// Waits one refresh interval and re-asserts the lights and done plug.
    pub fn refresh_end_state(&self) {
        self.end_sequence
            .refresh(&self.rig.switchboard, self.rig.clock.as_ref());
    }

    /// One unit of work for the outer loop.
    pub fn step(&mut self) -> SessionState {
        if self.critical {
            self.emergency_tick();
            return self.state;
        }
        let outcome = catch_unwind(AssertUnwindSafe(|| self.advance()));
        if let Err(payload) = outcome {
            let err = SessionError::Panicked(panic_message(payload.as_ref()));
            error!(error = %err, phase = ?self.phase, "critical error, entering emergency");
            self.failure = Some(err.to_string());
            self.critical = true;
            self.state = SessionState::Emergency;
            FailSafe::engage(&self.rig.switchboard);
        }
        self.state
    }

    fn emergency_tick(&mut self) {
        self.state = SessionState::Emergency;
        if !FailSafe::engage(&self.rig.switchboard) {
            warn!("fail-safe not fully confirmed, retrying");
        }
        self.rig.sleep(secs(self.config.polling.emergency_retry_secs));
    }

    fn deadline_reached(&self) -> bool {
        self.rig.now() >= self.deadline
    }

    fn advance(&mut self) {
        let next = match self.phase {
            Phase::AwaitStart => self.await_start(),
            Phase::Preparation => self.preparation(),
            Phase::Round => self.round(),
            Phase::Break { passed } => self.rest(passed),
            Phase::VoidBreak => self.void_break(),
            Phase::SensorLoss => self.sensor_loss(),
            Phase::Finish(reason) => self.finish(reason),
            Phase::Finished => Phase::Finished,
        };
        if next != self.phase {
            debug!(from = ?self.phase, to = ?next, "phase transition");
        }
        self.phase = next;
    }

    fn await_start(&mut self) -> Phase {
        self.state = SessionState::Waiting;
        if !self
            .start_button
            .update(self.rig.read_button(Button::Extension))
        {
            return Phase::AwaitStart;
        }

        let now = self.rig.now();
        self.started_at = Some(now);
        self.deadline = now + self.config.session_length();

        let wall_start = Local::now();
        let wall_deadline = chrono::Duration::from_std(self.config.session_length())
            .ok()
            .and_then(|d| wall_start.checked_add_signed(d));
        info!(
            start = %wall_start.format("%H:%M:%S"),
            deadline = %wall_deadline
                .map(|d| d.format("%H:%M:%S").to_string())
                .unwrap_or_default(),
            "session started"
        );

        self.rig.play(AudioCue::SessionStarted);
        self.rig.switchboard.set(Relay::Heater, true);
        Phase::Preparation
    }

    fn preparation(&mut self) -> Phase {
        self.state = SessionState::Preparation;
        if self.progress.ledger().is_met() {
            return Phase::Finish(EndReason::GoalAchieved);
        }
        if self.deadline_reached() {
            return Phase::Finish(EndReason::DeadlineReached);
        }

        let level = self.progress.level();
        let mut eligible = self.progress.extension_eligible();
        let remaining = self.progress.ledger().remaining();
        info!(
            %level,
            extension_eligible = eligible,
            remaining_mins = remaining.as_secs_f64() / 60.0,
            "preparation"
        );

        let board = self.rig.switchboard.clone();
        board.all_bulbs(false);
        board.set(Relay::Strobe, true);
        self.rig.vibrate(&self.config.stimulus);
        self.rig
            .play_and_wait(AudioCue::RoundStarting, self.config.cue_buffer());
        self.rig.play(AudioCue::level(level));
        if eligible {
            self.rig.sleep(EXTENSION_CUE_GAP);
            self.rig.play(AudioCue::ExtensionAvailable);
        }

        let mut extension_button = PressDetector::new();
        let mut rapid_button = PressDetector::new();
        extension_button.rebase(self.rig.read_button(Button::Extension));
        rapid_button.rebase(self.rig.read_button(Button::Rapid));

        let window = self.config.preparation_window();
        let pacer = Pacer::from_hz(self.config.polling.phase_hz);
        let mut elapsed = Duration::ZERO;
        let mut last = self.rig.now();
        let next = loop {
            pacer.pause(self.rig.clock.as_ref());
            let now = self.rig.now();
            elapsed += now.saturating_sub(last);
            last = now;
            if elapsed >= window {
                break Phase::Round;
            }
            if now >= self.deadline {
                break Phase::Finish(EndReason::DeadlineReached);
            }

            if extension_button.update(self.rig.read_button(Button::Extension)) {
                if !eligible {
                    debug!("extension button ignored, not eligible");
                } else if self.pool.in_cooldown(now) {
                    debug!("extension button ignored, cooldown");
                } else {
                    match self.pool.request(now, 0.0, 1.0) {
                        RequestDecision::Granted => {
                            self.rig.play(AudioCue::ExtensionGranted);
                            let end = run_extension(
                                &self.config,
                                &self.rig,
                                &mut self.pool,
                                &mut self.rng,
                                self.deadline,
                            );
                            eligible = false;
                            if end == ExtensionEnd::DeadlineReached {
                                break Phase::Finish(EndReason::DeadlineReached);
                            }
                        }
                        RequestDecision::Denied | RequestDecision::Exhausted => {
                            self.rig.play(AudioCue::ExtensionDeniedLimit);
                        }
                    }
                    last = self.rig.now();
                    extension_button.rebase(self.rig.read_button(Button::Extension));
                    rapid_button.rebase(self.rig.read_button(Button::Rapid));
                }
            }
            if rapid_button.update(self.rig.read_button(Button::Rapid)) {
                info!("rapid button pressed during preparation, rapid drills unavailable");
            }
        };

        board.set(Relay::Strobe, false);
        next
    }

    fn round(&mut self) -> Phase {
        self.state = SessionState::Round;
        let level = self.progress.level();
        let outcome = RoundController::new(
            &self.config,
            &self.rig,
            &mut self.fusion,
            &mut self.rng,
            self.deadline,
        )
        .run(level);

        match outcome {
            RoundOutcome::Completed(record) => {
                let verdict = self
                    .progress
                    .apply_round_result(&record, &self.config.levels);
                let ledger = self.progress.ledger();
                info!(
                    completed_mins = ledger.completed().as_secs_f64() / 60.0,
                    remaining_mins = ledger.remaining().as_secs_f64() / 60.0,
                    "training credited"
                );
                if ledger.is_met() {
                    Phase::Finish(EndReason::GoalAchieved)
                } else {
                    Phase::Break {
                        passed: verdict.passed,
                    }
                }
            }
            RoundOutcome::Voided(record) => {
                self.progress
                    .apply_round_result(&record, &self.config.levels);
                Phase::VoidBreak
            }
            RoundOutcome::SensorLost => Phase::SensorLoss,
            RoundOutcome::DeadlineReached => Phase::Finish(EndReason::DeadlineReached),
        }
    }

    fn rest(&mut self, passed: bool) -> Phase {
        self.state = SessionState::Break;
        let outcome = BreakController::new(
            &self.config,
            &self.rig,
            &mut self.pool,
            &mut self.rng,
            self.deadline,
        )
        .run(passed);
        match outcome {
            BreakOutcome::Completed => Phase::Preparation,
            BreakOutcome::DeadlineReached => Phase::Finish(EndReason::DeadlineReached),
        }
    }

    fn void_break(&mut self) -> Phase {
        self.state = SessionState::Break;
        let duration = self.config.void_break();
        warn!(duration_secs = duration.as_secs_f64(), "forced break after void");
        self.rig.switchboard.all_bulbs(false);
        self.rig.audio.start_ambient_loop();

        let started = self.rig.now();
        let mut next_log = VOID_BREAK_LOG_EVERY;
        let next = loop {
            let snapshot = self.rig.poll_sensors(&mut self.fusion);
            if snapshot.both_lost {
                break Phase::SensorLoss;
            }
            let elapsed = self.rig.now().saturating_sub(started);
            if elapsed >= duration {
                info!("void break complete");
                break Phase::Preparation;
            }
            if self.deadline_reached() {
                break Phase::Finish(EndReason::DeadlineReached);
            }
            if elapsed >= next_log {
                next_log += VOID_BREAK_LOG_EVERY;
                info!(
                    remaining_secs = duration.saturating_sub(elapsed).as_secs(),
                    "void break"
                );
            }
            self.rig.sleep(VOID_BREAK_POLL);
        };
        self.rig.audio.stop_ambient_loop();
        next
    }

    fn sensor_loss(&mut self) -> Phase {
        self.state = SessionState::Paused;
        let patience = self.config.loss_patience();
        let poll = secs(self.config.polling.sensor_wait_secs);
        let since = self.fusion.lost_since().unwrap_or_else(|| self.rig.now());
        warn!(
            patience_mins = patience.as_secs_f64() / 60.0,
            "both sensors lost, waiting for reconnection"
        );

        self.rig.switchboard.all_bulbs(false);
        self.rig.play(AudioCue::SensorIssue);
        self.rig.audio.start_ambient_loop();

        let mut next_log = SENSOR_WAIT_LOG_EVERY;
        loop {
            let waited = self.rig.now().saturating_sub(since);
            if waited >= patience {
                error!(
                    waited_mins = waited.as_secs_f64() / 60.0,
                    "sensor patience exhausted, ending session"
                );
                self.rig.audio.stop_ambient_loop();
                self.rig
                    .play_and_wait(AudioCue::SensorTimeout, self.config.cue_buffer());
                return Phase::Finish(EndReason::SensorTimeout);
            }

            self.rig.sleep(poll);

            if !self.rig.poll_sensors(&mut self.fusion).both_lost {
                info!("sensors reconnected, restarting from preparation");
                self.rig.audio.stop_ambient_loop();
                self.rig.play(AudioCue::SensorIssueResolved);
                return Phase::Preparation;
            }
            if self.deadline_reached() {
                info!("deadline reached while waiting for sensors");
                self.rig.audio.stop_ambient_loop();
                return Phase::Finish(EndReason::DeadlineReached);
            }
            if waited >= next_log {
                next_log += SENSOR_WAIT_LOG_EVERY;
                info!(
                    remaining_mins = patience.saturating_sub(waited).as_secs_f64() / 60.0,
                    "still waiting for sensors"
                );
            }
        }
    }

    fn finish(&mut self, reason: EndReason) -> Phase {
        self.state = SessionState::Finished;
        self.end_reason = Some(reason);
        self.rig.audio.stop_ambient_loop();
        self.rig.switchboard.set(Relay::Fan, false);

        let ledger = self.progress.ledger();
        info!(
            %reason,
            completed_mins = ledger.completed().as_secs_f64() / 60.0,
            goal_mins = ledger.current_goal().as_secs_f64() / 60.0,
            rounds = self.progress.rounds_played(),
            voided = self.progress.rounds_voided(),
            extension_mins = self.pool.used().as_secs_f64() / 60.0,
            extension_requests = self.pool.requests(),
            "session ended"
        );

        self.rig.play(AudioCue::TrainingEnded);
        self.end_sequence.arm(&self.rig.switchboard);
        Phase::Finished
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
