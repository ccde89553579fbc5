use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

use crate::config::LevelTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionState {
    Waiting,
    Preparation,
    Round,
    Break,
    /// Alias of Break with an active extension; never entered
    ExtendedBreak,
    Paused,
    Finished,
    Emergency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DifficultyLevel {
    Easy,
    Medium,
    Hard,
}

impl DifficultyLevel {
    /// Next rung after a pass; Hard wraps to Easy.
    pub fn next(self) -> Self {
        match self {
            DifficultyLevel::Easy => DifficultyLevel::Medium,
            DifficultyLevel::Medium => DifficultyLevel::Hard,
            DifficultyLevel::Hard => DifficultyLevel::Easy,
        }
    }
}

/// Outcome of one round, folded into [`Progress`] when the round ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundRecord {
    pub level: DifficultyLevel,
    pub duration: Duration,
    pub violations: u32,
    pub voided: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TrainingLedger {
    goal: Duration,
    penalty: Duration,
    cap: Duration,
    completed: Duration,
}

impl TrainingLedger {
    pub fn new(goal: Duration, cap: Duration) -> Self {
        Self {
            goal,
            penalty: Duration::ZERO,
            cap,
            completed: Duration::ZERO,
        }
    }

    pub fn goal(&self) -> Duration {
        self.goal
    }

    pub fn completed(&self) -> Duration {
        self.completed
    }

    pub fn penalty(&self) -> Duration {
        self.penalty
    }

    /// Goal plus penalties, capped.
    pub fn current_goal(&self) -> Duration {
        (self.goal + self.penalty).min(self.cap)
    }

    pub fn remaining(&self) -> Duration {
        self.current_goal().saturating_sub(self.completed)
    }

    pub fn is_met(&self) -> bool {
        self.completed >= self.current_goal()
    }

    pub fn add_penalty(&mut self, d: Duration) {
        self.penalty += d;
    }
}

/// What a round result did to the ladder and ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundVerdict {
    pub passed: bool,
    pub credited: Duration,
    pub bonus: Duration,
    pub next_level: DifficultyLevel,
    pub extension_eligible: bool,
}

/// Ledger, level ladder and extension eligibility for one session.
#[derive(Debug, Clone)]
pub struct Progress {
    ledger: TrainingLedger,
    level: DifficultyLevel,
    extension_eligible: bool,
    cycle_bonus: Duration,
    cycles_completed: u32,
    rounds_played: u32,
    rounds_voided: u32,
}

impl Progress {
    pub fn new(ledger: TrainingLedger, cycle_bonus: Duration) -> Self {
        Self {
            ledger,
            level: DifficultyLevel::Easy,
            extension_eligible: false,
            cycle_bonus,
            cycles_completed: 0,
            rounds_played: 0,
            rounds_voided: 0,
        }
    }

    pub fn ledger(&self) -> &TrainingLedger {
        &self.ledger
    }

    pub fn level(&self) -> DifficultyLevel {
        self.level
    }

    pub fn extension_eligible(&self) -> bool {
        self.extension_eligible
    }

    pub fn cycles_completed(&self) -> u32 {
        self.cycles_completed
    }

    pub fn rounds_played(&self) -> u32 {
        self.rounds_played
    }

    pub fn rounds_voided(&self) -> u32 {
        self.rounds_voided
    }

    /// The only place completed training time advances.
    ///
    /// Voided rounds earn nothing and leave the level alone. Otherwise the
    /// round's drawn duration is credited; a pass climbs the ladder (a Hard
    /// pass wraps to Easy with the cycle bonus), a fail drops to Easy.
    pub fn apply_round_result(&mut self, record: &RoundRecord, levels: &LevelTable) -> RoundVerdict {
        self.rounds_played += 1;
        let limit = levels.get(record.level).violation_limit;

        if record.voided {
            self.rounds_voided += 1;
            self.extension_eligible = false;
            warn!(level = %record.level, "round voided, no credit and no extension");
            return RoundVerdict {
                passed: false,
                credited: Duration::ZERO,
                bonus: Duration::ZERO,
                next_level: self.level,
                extension_eligible: false,
            };
        }

        self.ledger.completed += record.duration;
        let passed = record.violations < limit;
        let mut bonus = Duration::ZERO;

        if passed {
            self.extension_eligible = false;
            if record.level == DifficultyLevel::Hard {
                bonus = self.cycle_bonus;
                self.ledger.completed += bonus;
                self.cycles_completed += 1;
                self.extension_eligible = true;
                info!(bonus_secs = bonus.as_secs(), "cycle complete");
            }
            self.level = record.level.next();
            info!(
                violations = record.violations,
                limit,
                next = %self.level,
                "round passed"
            );
        } else {
            self.level = DifficultyLevel::Easy;
            self.extension_eligible = true;
            warn!(
                violations = record.violations,
                limit,
                "round failed, back to easy"
            );
        }

        RoundVerdict {
            passed,
            credited: record.duration,
            bonus,
            next_level: self.level,
            extension_eligible: self.extension_eligible,
        }
    }
}
