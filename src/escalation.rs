use std::time::Duration;
use tracing::{debug, warn};

use crate::fusion::Position;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscalationPolicy {
    /// Consecutive stimulations that void the round
    pub ceiling: u32,
    /// Re-stimulation interval while a violation is unresolved
    pub cadence: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Idle,
    /// Commanded, not yet achieved
    Pending { grace_until: Duration },
    Held { since: Duration },
    /// Lost after a hold, inside the grace window
    Slipping { grace_until: Duration },
    Violating {
        since: Duration,
        last_stimulus: Duration,
        after_hold: bool,
    },
}

/// What one observation asks the caller to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Waiting,
    /// Commanded position reached for the first time this attempt
    Achieved { violation_time: Duration },
    /// Position lost after a hold; grace window opened
    Slipped,
    /// Lost position recovered within grace; hold restarts, no violation
    Regained,
    /// Lost position recovered after a violation
    Corrected { violation_time: Duration },
    /// A fresh violation: stimulate, and play the violation cue if `announce`
    Violation { announce: bool },
    /// Cadence re-stimulation of an unresolved violation
    Restimulate { consecutive: u32 },
    /// Ceiling reached on this tick; stimulate once more and void the round
    Void,
}

/// Achieve-then-hold escalation for one commanded position at a time.
///
/// Pure state machine: the caller feeds `(now, in_position)` once per tick
/// after sensor evaluation and acts on the returned [`Step`]. The consecutive
/// counter rises with every violation and re-stimulation and drops to zero
/// whenever the position is (re-)achieved.
#[derive(Debug, Clone)]
pub struct EscalationProtocol {
    policy: EscalationPolicy,
    target: Option<Position>,
    budget: Duration,
    rapid: bool,
    announced: bool,
    stage: Stage,
    consecutive: u32,
    round_violations: u32,
}

impl EscalationProtocol {
    pub fn new(policy: EscalationPolicy) -> Self {
        Self {
            policy,
            target: None,
            budget: Duration::ZERO,
            rapid: false,
            announced: false,
            stage: Stage::Idle,
            consecutive: 0,
            round_violations: 0,
        }
    }

    /// Starts a new attempt: `target` was just commanded at `now`.
    pub fn begin(&mut self, target: Position, now: Duration, budget: Duration, rapid: bool) {
        self.target = Some(target);
        self.budget = budget;
        self.rapid = rapid;
        self.announced = false;
        self.stage = Stage::Pending {
            grace_until: now + budget,
        };
    }

    /// Starts an attempt whose position is already verified, e.g. the initial DOWN.
    pub fn begin_held(&mut self, target: Position, now: Duration, budget: Duration) {
        self.target = Some(target);
        self.budget = budget;
        self.rapid = false;
        self.announced = false;
        self.consecutive = 0;
        self.stage = Stage::Held { since: now };
    }

    pub fn target(&self) -> Option<Position> {
        self.target
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn round_violations(&self) -> u32 {
        self.round_violations
    }

    pub fn is_holding(&self) -> bool {
        matches!(self.stage, Stage::Held { .. })
    }

    /// Uninterrupted hold time, zero unless currently holding.
    pub fn held_for(&self, now: Duration) -> Duration {
        match self.stage {
            Stage::Held { since } => now.saturating_sub(since),
            _ => Duration::ZERO,
        }
    }

    /// Length of the unresolved violation episode, if any.
    pub fn ongoing_violation(&self, now: Duration) -> Duration {
        match self.stage {
            Stage::Violating { since, .. } => now.saturating_sub(since),
            _ => Duration::ZERO,
        }
    }

    pub fn observe(&mut self, now: Duration, in_position: bool) -> Step {
        match self.stage {
            Stage::Idle => Step::Waiting,
            Stage::Pending { grace_until } => {
                if in_position {
                    self.consecutive = 0;
                    self.stage = Stage::Held { since: now };
                    Step::Achieved {
                        violation_time: Duration::ZERO,
                    }
                } else if now >= grace_until {
                    self.violate(now, false)
                } else {
                    Step::Waiting
                }
            }
            Stage::Held { .. } => {
                if in_position {
                    Step::Waiting
                } else {
                    debug!(position = ?self.target, "position slipped, grace window open");
                    self.stage = Stage::Slipping {
                        grace_until: now + self.budget,
                    };
                    Step::Slipped
                }
            }
            Stage::Slipping { grace_until } => {
                if in_position {
                    self.consecutive = 0;
                    self.stage = Stage::Held { since: now };
                    Step::Regained
                } else if now >= grace_until {
                    self.violate(now, true)
                } else {
                    Step::Waiting
                }
            }
            Stage::Violating {
                since,
                last_stimulus,
                after_hold,
            } => {
                if in_position {
                    let violation_time = now.saturating_sub(since);
                    self.consecutive = 0;
                    self.stage = Stage::Held { since: now };
                    if after_hold {
                        Step::Corrected { violation_time }
                    } else {
                        Step::Achieved { violation_time }
                    }
                } else if now.saturating_sub(last_stimulus) >= self.policy.cadence {
                    self.consecutive += 1;
                    self.stage = Stage::Violating {
                        since,
                        last_stimulus: now,
                        after_hold,
                    };
                    if self.consecutive >= self.policy.ceiling {
                        self.void()
                    } else {
                        Step::Restimulate {
                            consecutive: self.consecutive,
                        }
                    }
                } else {
                    Step::Waiting
                }
            }
        }
    }

    fn violate(&mut self, now: Duration, after_hold: bool) -> Step {
        self.round_violations += 1;
        self.consecutive += 1;
        self.stage = Stage::Violating {
            since: now,
            last_stimulus: now,
            after_hold,
        };
        warn!(
            position = ?self.target,
            round_violations = self.round_violations,
            consecutive = self.consecutive,
            after_hold,
            "position violation"
        );
        if self.consecutive >= self.policy.ceiling {
            return self.void();
        }
        let announce = !self.rapid && !self.announced;
        self.announced = true;
        Step::Violation { announce }
    }

    fn void(&mut self) -> Step {
        warn!(
            consecutive = self.consecutive,
            ceiling = self.policy.ceiling,
            "consecutive violation ceiling reached"
        );
        self.stage = Stage::Idle;
        Step::Void
    }
}
