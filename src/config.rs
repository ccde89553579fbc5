use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::app_dirs::AppDirs;
use crate::session::DifficultyLevel;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("{field}: range min {min} exceeds max {max}")]
    InvalidRange {
        field: &'static str,
        min: f64,
        max: f64,
    },
    #[error("{field}: value {value} is out of bounds")]
    OutOfBounds { field: &'static str, value: f64 },
}

/// Longest span any setting may express; keeps every `Duration` conversion finite.
const MAX_SECS: f64 = 7.0 * 24.0 * 3600.0;
const MAX_HZ: f64 = 1000.0;

pub(crate) fn secs(v: f64) -> Duration {
    Duration::from_secs_f64(v.max(0.0))
}

fn check_secs(field: &'static str, value: f64, allow_zero: bool) -> Result<(), ConfigError> {
    let floor = if allow_zero { value >= 0.0 } else { value > 0.0 };
    if floor && value <= MAX_SECS {
        Ok(())
    } else {
        Err(ConfigError::OutOfBounds { field, value })
    }
}

/// Inclusive `[min, max]` range in seconds
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SecondsRange {
    pub min: f64,
    pub max: f64,
}

impl SecondsRange {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn max_duration(&self) -> Duration {
        secs(self.max)
    }

    /// Uniform draw over the continuous range.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        if self.max <= self.min {
            return secs(self.min);
        }
        secs(rng.gen_range(self.min..=self.max))
    }

    /// Uniform draw over the whole seconds in the range.
    pub fn sample_whole_secs<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let lo = self.min.max(0.0).round() as u64;
        let hi = self.max.max(0.0).round() as u64;
        if hi <= lo {
            return Duration::from_secs(lo);
        }
        Duration::from_secs(rng.gen_range(lo..=hi))
    }

    fn validate(&self, field: &'static str) -> Result<(), ConfigError> {
        check_secs(field, self.min, true)?;
        check_secs(field, self.max, true)?;
        if self.min > self.max {
            return Err(ConfigError::InvalidRange {
                field,
                min: self.min,
                max: self.max,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct LevelConfig {
    pub round_duration: SecondsRange,
    /// Grace budget per commanded position
    pub transition_time: SecondsRange,
    pub hold_time_up: SecondsRange,
    pub hold_time_down: SecondsRange,
    /// A round passes with strictly fewer violations than this
    pub violation_limit: u32,
}

impl LevelConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        self.round_duration.validate("levels.round_duration")?;
        self.transition_time.validate("levels.transition_time")?;
        self.hold_time_up.validate("levels.hold_time_up")?;
        self.hold_time_down.validate("levels.hold_time_down")?;
        if self.violation_limit == 0 {
            return Err(ConfigError::OutOfBounds {
                field: "levels.violation_limit",
                value: 0.0,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct LevelTable {
    pub easy: LevelConfig,
    pub medium: LevelConfig,
    pub hard: LevelConfig,
}

impl LevelTable {
    pub fn get(&self, level: DifficultyLevel) -> &LevelConfig {
        match level {
            DifficultyLevel::Easy => &self.easy,
            DifficultyLevel::Medium => &self.medium,
            DifficultyLevel::Hard => &self.hard,
        }
    }
}

impl Default for LevelTable {
    fn default() -> Self {
        Self {
            easy: LevelConfig {
                round_duration: SecondsRange::new(180.0, 300.0),
                transition_time: SecondsRange::new(10.0, 12.0),
                hold_time_up: SecondsRange::new(3.0, 8.0),
                hold_time_down: SecondsRange::new(12.0, 16.0),
                violation_limit: 6,
            },
            medium: LevelConfig {
                round_duration: SecondsRange::new(240.0, 360.0),
                transition_time: SecondsRange::new(8.0, 10.0),
                hold_time_up: SecondsRange::new(7.0, 12.0),
                hold_time_down: SecondsRange::new(8.0, 12.0),
                violation_limit: 5,
            },
            hard: LevelConfig {
                round_duration: SecondsRange::new(300.0, 420.0),
                transition_time: SecondsRange::new(6.0, 8.0),
                hold_time_up: SecondsRange::new(11.0, 16.0),
                hold_time_down: SecondsRange::new(4.0, 8.0),
                violation_limit: 4,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ExtensionConfig {
    pub request_cooldown_secs: f64,
    pub pool_secs: f64,
    /// Requests are refused with the limit cue below this remainder
    pub min_grantable_secs: f64,
    pub approval_probability: f64,
    pub fan_delay: SecondsRange,
}

impl Default for ExtensionConfig {
    fn default() -> Self {
        Self {
            request_cooldown_secs: 25.0,
            pool_secs: 4.0 * 3600.0,
            min_grantable_secs: 60.0,
            approval_probability: 0.5,
            fan_delay: SecondsRange::new(15.0 * 60.0, 25.0 * 60.0),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SensorConfig {
    pub staleness_secs: f64,
    pub loss_patience_secs: f64,
    pub startup_timeout_secs: f64,
    pub down_below_deg: i32,
    pub up_above_deg: i32,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            staleness_secs: 5.0,
            loss_patience_secs: 3600.0,
            startup_timeout_secs: 30.0,
            down_below_deg: 20,
            up_above_deg: 80,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct StimulusConfig {
    pub shock_intensity_min: u8,
    pub shock_intensity_max: u8,
    pub shock_duration_min_secs: u8,
    pub shock_duration_max_secs: u8,
    pub vibrate_intensity: u8,
    pub vibrate_duration_secs: u8,
}

impl Default for StimulusConfig {
    fn default() -> Self {
        Self {
            shock_intensity_min: 60,
            shock_intensity_max: 100,
            shock_duration_min_secs: 1,
            shock_duration_max_secs: 2,
            vibrate_intensity: 30,
            vibrate_duration_secs: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PollingConfig {
    pub session_hz: f64,
    pub phase_hz: f64,
    pub achievement_hz: f64,
    pub sensor_wait_secs: f64,
    pub emergency_retry_secs: f64,
    pub end_refresh_secs: f64,
    pub hardware_monitor_secs: f64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            session_hz: 60.0,
            phase_hz: 10.0,
            achievement_hz: 30.0,
            sensor_wait_secs: 5.0,
            emergency_retry_secs: 5.0,
            end_refresh_secs: 30.0,
            hardware_monitor_secs: 10.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrainingConfig {
    pub session_hours: f64,
    pub training_goal: SecondsRange,
    pub max_training_secs: f64,
    pub levels: LevelTable,
    pub cycle_completion_bonus_secs: f64,
    pub void_break_secs: f64,
    pub violation_ceiling: u32,
    pub restimulate_interval_secs: f64,
    pub break_duration: SecondsRange,
    pub preparation_window_secs: f64,
    pub cue_buffer_secs: f64,
    pub rapid_transition_secs: f64,
    pub position_confirmation_secs: f64,
    pub end_signal_delay: SecondsRange,
    pub extension: ExtensionConfig,
    pub sensors: SensorConfig,
    pub stimulus: StimulusConfig,
    pub polling: PollingConfig,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            session_hours: 10.0,
            training_goal: SecondsRange::new(140.0 * 60.0, 200.0 * 60.0),
            max_training_secs: 5.0 * 3600.0,
            levels: LevelTable::default(),
            cycle_completion_bonus_secs: 20.0 * 60.0,
            void_break_secs: 180.0,
            violation_ceiling: 7,
            restimulate_interval_secs: 5.0,
            break_duration: SecondsRange::new(30.0, 45.0),
            preparation_window_secs: 20.0,
            cue_buffer_secs: 0.3,
            rapid_transition_secs: 5.0,
            position_confirmation_secs: 1.0,
            end_signal_delay: SecondsRange::new(180.0, 300.0),
            extension: ExtensionConfig::default(),
            sensors: SensorConfig::default(),
            stimulus: StimulusConfig::default(),
            polling: PollingConfig::default(),
        }
    }
}

impl TrainingConfig {
    /// Shortened timings for bench testing; every extension request is granted.
    pub fn testing() -> Self {
        let mut cfg = Self {
            session_hours: 1.0,
            training_goal: SecondsRange::new(5.0 * 60.0, 10.0 * 60.0),
            break_duration: SecondsRange::new(20.0, 30.0),
            void_break_secs: 30.0,
            ..Self::default()
        };
        cfg.sensors.loss_patience_secs = 2.0 * 60.0;
        cfg.extension.approval_probability = 1.0;
        for level in [
            &mut cfg.levels.easy,
            &mut cfg.levels.medium,
            &mut cfg.levels.hard,
        ] {
            level.round_duration = SecondsRange::new(60.0, 120.0);
        }
        cfg
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.session_hours > 0.0 && self.session_hours * 3600.0 <= MAX_SECS) {
            return Err(ConfigError::OutOfBounds {
                field: "session_hours",
                value: self.session_hours,
            });
        }
        self.training_goal.validate("training_goal")?;
        self.break_duration.validate("break_duration")?;
        self.end_signal_delay.validate("end_signal_delay")?;
        self.extension.fan_delay.validate("extension.fan_delay")?;
        for level in [&self.levels.easy, &self.levels.medium, &self.levels.hard] {
            level.validate()?;
        }
        if self.violation_ceiling == 0 {
            return Err(ConfigError::OutOfBounds {
                field: "violation_ceiling",
                value: 0.0,
            });
        }
        let p = self.extension.approval_probability;
        if !(0.0..=1.0).contains(&p) {
            return Err(ConfigError::OutOfBounds {
                field: "extension.approval_probability",
                value: p,
            });
        }
        if self.stimulus.shock_intensity_min > self.stimulus.shock_intensity_max {
            return Err(ConfigError::InvalidRange {
                field: "stimulus.shock_intensity",
                min: self.stimulus.shock_intensity_min as f64,
                max: self.stimulus.shock_intensity_max as f64,
            });
        }
        if self.stimulus.shock_duration_min_secs > self.stimulus.shock_duration_max_secs {
            return Err(ConfigError::InvalidRange {
                field: "stimulus.shock_duration",
                min: self.stimulus.shock_duration_min_secs as f64,
                max: self.stimulus.shock_duration_max_secs as f64,
            });
        }
        if self.sensors.down_below_deg >= self.sensors.up_above_deg {
            return Err(ConfigError::InvalidRange {
                field: "sensors.thresholds",
                min: self.sensors.down_below_deg as f64,
                max: self.sensors.up_above_deg as f64,
            });
        }
        let rates = [
            ("polling.session_hz", self.polling.session_hz),
            ("polling.phase_hz", self.polling.phase_hz),
            ("polling.achievement_hz", self.polling.achievement_hz),
        ];
        for (field, value) in rates {
            if !(value > 0.0 && value <= MAX_HZ) {
                return Err(ConfigError::OutOfBounds { field, value });
            }
        }
        let intervals = [
            ("polling.sensor_wait_secs", self.polling.sensor_wait_secs),
            ("polling.emergency_retry_secs", self.polling.emergency_retry_secs),
            ("polling.end_refresh_secs", self.polling.end_refresh_secs),
            ("polling.hardware_monitor_secs", self.polling.hardware_monitor_secs),
            ("sensors.staleness_secs", self.sensors.staleness_secs),
            ("restimulate_interval_secs", self.restimulate_interval_secs),
        ];
        for (field, value) in intervals {
            check_secs(field, value, false)?;
        }
        let spans = [
            ("max_training_secs", self.max_training_secs),
            ("cycle_completion_bonus_secs", self.cycle_completion_bonus_secs),
            ("void_break_secs", self.void_break_secs),
            ("preparation_window_secs", self.preparation_window_secs),
            ("cue_buffer_secs", self.cue_buffer_secs),
            ("rapid_transition_secs", self.rapid_transition_secs),
            ("position_confirmation_secs", self.position_confirmation_secs),
            ("extension.request_cooldown_secs", self.extension.request_cooldown_secs),
            ("extension.pool_secs", self.extension.pool_secs),
            ("extension.min_grantable_secs", self.extension.min_grantable_secs),
            ("sensors.loss_patience_secs", self.sensors.loss_patience_secs),
            ("sensors.startup_timeout_secs", self.sensors.startup_timeout_secs),
        ];
        for (field, value) in spans {
            check_secs(field, value, true)?;
        }
        Ok(())
    }

    pub fn session_length(&self) -> Duration {
        secs(self.session_hours * 3600.0)
    }

    pub fn training_cap(&self) -> Duration {
        secs(self.max_training_secs)
    }

    pub fn cycle_bonus(&self) -> Duration {
        secs(self.cycle_completion_bonus_secs)
    }

    pub fn void_break(&self) -> Duration {
        secs(self.void_break_secs)
    }

    pub fn restimulate_interval(&self) -> Duration {
        secs(self.restimulate_interval_secs)
    }

    pub fn preparation_window(&self) -> Duration {
        secs(self.preparation_window_secs)
    }

    pub fn cue_buffer(&self) -> Duration {
        secs(self.cue_buffer_secs)
    }

    pub fn rapid_transition(&self) -> Duration {
        secs(self.rapid_transition_secs)
    }

    pub fn position_confirmation(&self) -> Duration {
        secs(self.position_confirmation_secs)
    }

    pub fn staleness(&self) -> Duration {
        secs(self.sensors.staleness_secs)
    }

    pub fn loss_patience(&self) -> Duration {
        secs(self.sensors.loss_patience_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        secs(self.sensors.startup_timeout_secs)
    }

    pub fn request_cooldown(&self) -> Duration {
        secs(self.extension.request_cooldown_secs)
    }

    pub fn extension_pool(&self) -> Duration {
        secs(self.extension.pool_secs)
    }

    pub fn min_grantable(&self) -> Duration {
        secs(self.extension.min_grantable_secs)
    }
}

pub trait ConfigStore {
    fn load(&self) -> Result<TrainingConfig, ConfigError>;
    fn save(&self, cfg: &TrainingConfig) -> Result<(), ConfigError>;
}

#[derive(Debug, Clone)]
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            path: AppDirs::config_path(),
        }
    }

    pub fn with_path<P: AsRef<Path>>(p: P) -> Self {
        Self {
            path: p.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for FileConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigStore for FileConfigStore {
    /// A missing file yields the defaults; a malformed or invalid one is an error.
    fn load(&self) -> Result<TrainingConfig, ConfigError> {
        let cfg = match fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice::<TrainingConfig>(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => TrainingConfig::default(),
            Err(e) => return Err(e.into()),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn save(&self, cfg: &TrainingConfig) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(cfg)?;
        fs::write(&self.path, data)?;
        Ok(())
    }
}
