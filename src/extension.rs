use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestDecision {
    Granted,
    /// Lost the approval draw
    Denied,
    /// Pool too low to grant anything
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveExtension {
    pub started_at: Duration,
    pub fan_at: Duration,
    pub fan_on: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinishedExtension {
    pub duration: Duration,
    pub fan_was_on: bool,
}

/// Session-wide extension bookkeeping. `used` only grows, by exactly the
/// length of each finished extension.
#[derive(Debug, Clone)]
pub struct ExtensionPool {
    allowed: Duration,
    min_grantable: Duration,
    cooldown: Duration,
    used: Duration,
    requests: u32,
    last_request: Option<Duration>,
    active: Option<ActiveExtension>,
}

impl ExtensionPool {
    pub fn new(allowed: Duration, min_grantable: Duration, cooldown: Duration) -> Self {
        Self {
            allowed,
            min_grantable,
            cooldown,
            used: Duration::ZERO,
            requests: 0,
            last_request: None,
            active: None,
        }
    }

    pub fn used(&self) -> Duration {
        self.used
    }

    pub fn remaining(&self) -> Duration {
        self.allowed.saturating_sub(self.used)
    }

    pub fn requests(&self) -> u32 {
        self.requests
    }

    pub fn active(&self) -> Option<&ActiveExtension> {
        self.active.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn in_cooldown(&self, now: Duration) -> bool {
        self.last_request
            .is_some_and(|t| now.saturating_sub(t) < self.cooldown)
    }

    /// Evaluates a request against the pool first, then the approval draw.
    /// `roll` is uniform in `[0, 1)`.
    pub fn request(&mut self, now: Duration, roll: f64, probability: f64) -> RequestDecision {
        self.requests += 1;
        self.last_request = Some(now);
        let remaining = self.remaining();
        let decision = if self.used >= self.allowed || remaining < self.min_grantable {
            RequestDecision::Exhausted
        } else if roll < probability {
            RequestDecision::Granted
        } else {
            RequestDecision::Denied
        };
        info!(
            ?decision,
            requests = self.requests,
            remaining_secs = remaining.as_secs(),
            "extension request"
        );
        decision
    }

    pub fn begin(&mut self, now: Duration, fan_delay: Duration) {
        self.active = Some(ActiveExtension {
            started_at: now,
            fan_at: now + fan_delay,
            fan_on: false,
        });
    }

    pub fn fan_due(&self, now: Duration) -> bool {
        self.active.is_some_and(|a| !a.fan_on && now >= a.fan_at)
    }

    pub fn mark_fan_on(&mut self) {
        if let Some(a) = self.active.as_mut() {
            a.fan_on = true;
        }
    }

    /// Ends the active extension and charges its length to the pool.
    pub fn finish(&mut self, now: Duration) -> Option<FinishedExtension> {
        let active = self.active.take()?;
        let duration = now.saturating_sub(active.started_at);
        self.used += duration;
        Some(FinishedExtension {
            duration,
            fan_was_on: active.fan_on,
        })
    }
}
