use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::audio::{AudioCue, AudioPlayer};
use crate::config::StimulusConfig;
use crate::devices::{AngleSource, Button, ButtonPanel, Stimulus, StimulusMode, Switchboard};
use crate::dispatch::StimulusDispatcher;
use crate::fusion::{SensorFusion, SensorSnapshot};
use crate::runtime::Clock;

/// Every collaborator a session talks to, plus the clock it runs on.
pub struct Rig {
    pub sensors: Box<dyn AngleSource>,
    pub switchboard: Switchboard,
    pub buttons: Box<dyn ButtonPanel>,
    pub audio: Box<dyn AudioPlayer>,
    pub stimulus: StimulusDispatcher,
    pub clock: Arc<dyn Clock>,
}

impl Rig {
    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    pub fn sleep(&self, d: Duration) {
        self.clock.sleep(d)
    }

    /// One sensor evaluation: angle, then the both-lost edge.
    pub fn poll_sensors(&self, fusion: &mut SensorFusion) -> SensorSnapshot {
        let snapshot = fusion.observe(self.sensors.as_ref(), self.now());
        for event in fusion.drain_events() {
            debug!(?event, "sensor fusion event");
        }
        snapshot
    }

    pub fn read_button(&self, button: Button) -> Option<u64> {
        self.buttons.read_counter(button)
    }

    pub fn play(&self, cue: AudioCue) -> Duration {
        let length = self.audio.play(cue);
        debug!(%cue, length_secs = length.as_secs_f64(), "cue");
        length
    }

    /// Plays `cue` and waits out its reported length plus `buffer`.
    pub fn play_and_wait(&self, cue: AudioCue, buffer: Duration) {
        let length = self.play(cue);
        self.sleep(length + buffer);
    }

    pub fn shock<R: Rng + ?Sized>(&self, rng: &mut R, cfg: &StimulusConfig) {
        self.stimulus.dispatch(Stimulus {
            mode: StimulusMode::Shock,
            intensity: rng.gen_range(cfg.shock_intensity_min..=cfg.shock_intensity_max),
            duration_secs: rng.gen_range(cfg.shock_duration_min_secs..=cfg.shock_duration_max_secs),
        });
    }

    pub fn vibrate(&self, cfg: &StimulusConfig) {
        self.stimulus.dispatch(Stimulus {
            mode: StimulusMode::Vibrate,
            intensity: cfg.vibrate_intensity,
            duration_secs: cfg.vibrate_duration_secs,
        });
    }
}
