use std::time::Duration;

use crate::fusion::Position;
use crate::session::DifficultyLevel;

/// Every cue the session can play. The display form is the sound-bank
/// folder the player draws a random variation from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum AudioCue {
    #[strum(serialize = "second_press")]
    SessionStarted,
    #[strum(serialize = "down")]
    PositionDown,
    #[strum(serialize = "up")]
    PositionUp,
    RoundStarting,
    RoundOver,
    RoundPassed,
    RoundFailed,
    #[strum(serialize = "easy_level")]
    LevelEasy,
    #[strum(serialize = "medium_level")]
    LevelMedium,
    #[strum(serialize = "hard_level")]
    LevelHard,
    ExtensionAvailable,
    Violation,
    TenInRow,
    SensorIssue,
    SensorIssueResolved,
    #[strum(serialize = "game_end_timeout")]
    SensorTimeout,
    ExtensionGranted,
    ExtensionDenied,
    ExtensionDeniedLimit,
    TrainingEnded,
}

impl AudioCue {
    pub fn command(position: Position) -> Self {
        match position {
            Position::Down => AudioCue::PositionDown,
            Position::Up => AudioCue::PositionUp,
        }
    }

    pub fn level(level: DifficultyLevel) -> Self {
        match level {
            DifficultyLevel::Easy => AudioCue::LevelEasy,
            DifficultyLevel::Medium => AudioCue::LevelMedium,
            DifficultyLevel::Hard => AudioCue::LevelHard,
        }
    }
}

/// Sound playback collaborator. Never fails: a missing file or a playback
/// error reports a zero duration.
pub trait AudioPlayer: Send {
    /// Starts the cue without blocking and reports its length.
    fn play(&self, cue: AudioCue) -> Duration;
    /// Looping white-noise masking
    fn start_ambient_loop(&self);
    fn stop_ambient_loop(&self);
}
