use rand::rngs::StdRng;
use rand::Rng;
use std::time::Duration;
use tracing::{debug, info};

use crate::audio::AudioCue;
use crate::config::TrainingConfig;
use crate::devices::{Button, PressDetector, Relay};
use crate::extension::{ExtensionPool, RequestDecision};
use crate::rig::Rig;
use crate::runtime::Pacer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakOutcome {
    Completed,
    DeadlineReached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionEnd {
    /// Ended by a button press
    Released,
    DeadlineReached,
}

/// Runs a granted extension until either button is pressed or the session
/// deadline passes, then charges its length to the pool.
///
/// The fan comes on once, after the drawn delay, with the heater switched off
/// for as long as the fan runs.
pub fn run_extension(
    config: &TrainingConfig,
    rig: &Rig,
    pool: &mut ExtensionPool,
    rng: &mut StdRng,
    deadline: Duration,
) -> ExtensionEnd {
    let fan_delay = config.extension.fan_delay.sample(rng);
    pool.begin(rig.now(), fan_delay);
    info!(
        fan_after_mins = fan_delay.as_secs_f64() / 60.0,
        "extension started, press any button to end"
    );

    let mut extension_button = PressDetector::new();
    let mut rapid_button = PressDetector::new();
    extension_button.rebase(rig.read_button(Button::Extension));
    rapid_button.rebase(rig.read_button(Button::Rapid));

    let pacer = Pacer::from_hz(config.polling.phase_hz);
    let mut logged_minutes = 0;
    let end = loop {
        pacer.pause(rig.clock.as_ref());
        let now = rig.now();

        if pool.fan_due(now) {
            info!("extension fan on");
            rig.switchboard.set(Relay::Heater, false);
            rig.switchboard.set(Relay::Fan, true);
            pool.mark_fan_on();
        }

        let first = extension_button.update(rig.read_button(Button::Extension));
        let second = rapid_button.update(rig.read_button(Button::Rapid));
        if first || second {
            break ExtensionEnd::Released;
        }
        if now >= deadline {
            break ExtensionEnd::DeadlineReached;
        }

        let minutes = pool
            .active()
            .map(|a| now.saturating_sub(a.started_at).as_secs() / 60)
            .unwrap_or(0);
        if minutes > logged_minutes {
            logged_minutes = minutes;
            debug!(minutes, "extension running");
        }
    };

    if let Some(done) = pool.finish(rig.now()) {
        if done.fan_was_on {
            rig.switchboard.set(Relay::Fan, false);
            rig.switchboard.set(Relay::Heater, true);
        }
        info!(
            duration_mins = done.duration.as_secs_f64() / 60.0,
            used_hours = pool.used().as_secs_f64() / 3600.0,
            remaining_hours = pool.remaining().as_secs_f64() / 3600.0,
            "extension ended"
        );
    }
    end
}

/// Evaluates a request and plays the matching cue; runs the extension when granted.
pub fn handle_extension_request(
    config: &TrainingConfig,
    rig: &Rig,
    pool: &mut ExtensionPool,
    rng: &mut StdRng,
    deadline: Duration,
) -> Option<ExtensionEnd> {
    let roll: f64 = rng.gen();
    match pool.request(rig.now(), roll, config.extension.approval_probability) {
        RequestDecision::Granted => {
            rig.play(AudioCue::ExtensionGranted);
            Some(run_extension(config, rig, pool, rng, deadline))
        }
        RequestDecision::Denied => {
            rig.play(AudioCue::ExtensionDenied);
            None
        }
        RequestDecision::Exhausted => {
            rig.play(AudioCue::ExtensionDeniedLimit);
            None
        }
    }
}

/// Rest interval between rounds, with the extension lottery.
pub struct BreakController<'a> {
    config: &'a TrainingConfig,
    rig: &'a Rig,
    pool: &'a mut ExtensionPool,
    rng: &'a mut StdRng,
    deadline: Duration,
}

impl<'a> BreakController<'a> {
    pub fn new(
        config: &'a TrainingConfig,
        rig: &'a Rig,
        pool: &'a mut ExtensionPool,
        rng: &'a mut StdRng,
        deadline: Duration,
    ) -> Self {
        Self {
            config,
            rig,
            pool,
            rng,
            deadline,
        }
    }

    /// The break clock keeps running through extensions.
    pub fn run(&mut self, passed: bool) -> BreakOutcome {
        let rig = self.rig;
        let duration = self.config.break_duration.sample(&mut *self.rng);
        let started = rig.now();
        info!(duration_secs = duration.as_secs_f64(), passed, "break starting");

        rig.play_and_wait(AudioCue::RoundOver, self.config.cue_buffer());
        rig.play(if passed {
            AudioCue::RoundPassed
        } else {
            AudioCue::RoundFailed
        });
        rig.audio.start_ambient_loop();

        let mut button = PressDetector::new();
        button.rebase(rig.read_button(Button::Extension));
        let pacer = Pacer::from_hz(self.config.polling.phase_hz);

        let outcome = loop {
            let now = rig.now();
            if now.saturating_sub(started) >= duration {
                break BreakOutcome::Completed;
            }
            if now >= self.deadline {
                break BreakOutcome::DeadlineReached;
            }

            if button.update(rig.read_button(Button::Extension)) {
                if self.pool.in_cooldown(now) {
                    debug!("extension request ignored, cooldown");
                } else {
                    let end = handle_extension_request(
                        self.config,
                        rig,
                        self.pool,
                        self.rng,
                        self.deadline,
                    );
                    if end == Some(ExtensionEnd::DeadlineReached) {
                        break BreakOutcome::DeadlineReached;
                    }
                    button.rebase(rig.read_button(Button::Extension));
                }
            }
            pacer.pause(rig.clock.as_ref());
        };

        rig.audio.stop_ambient_loop();
        rig.switchboard.set(Relay::Fan, false);
        info!(?outcome, "break over");
        outcome
    }
}
