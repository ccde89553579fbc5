use std::future::Future;
use std::io;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::devices::{Relay, Switchboard};
use crate::runtime::Clock;

/// Fail-safe hardware state: done plug on and every light on.
pub struct FailSafe;

impl FailSafe {
    /// Returns true when every switch was confirmed.
    pub fn engage(board: &Switchboard) -> bool {
        let plug = board.set(Relay::DonePlug, true);
        let down = board.set(Relay::DownBulb, true);
        let up = board.set(Relay::UpBulb, true);
        plug && down && up
    }
}

/// Terminal hardware sequence after a session ends.
///
/// Lights go on at once; the done plug follows after the activation delay;
/// from then on lights and plug are re-asserted every refresh interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndSequence {
    activation_delay: Duration,
    refresh: Duration,
}

impl EndSequence {
    pub fn new(activation_delay: Duration, refresh: Duration) -> Self {
        Self {
            activation_delay,
            refresh,
        }
    }

    pub fn activation_delay(&self) -> Duration {
        self.activation_delay
    }

    pub fn arm(&self, board: &Switchboard) {
        board.all_bulbs(true);
        info!(
            delay_mins = self.activation_delay.as_secs_f64() / 60.0,
            "end sequence armed, lights on"
        );
    }

    pub fn activate(&self, board: &Switchboard) {
        board.set(Relay::DonePlug, true);
        info!("done signal active");
    }

    pub fn maintain(&self, board: &Switchboard) {
        board.set(Relay::DonePlug, true);
        board.all_bulbs(true);
    }

    /// Waits out the activation delay, then turns the done plug on.
    pub fn activate_after_delay(&self, board: &Switchboard, clock: &dyn Clock) {
        clock.sleep(self.activation_delay);
        self.activate(board);
    }

    /// One refresh interval, then both lights and plug again.
    pub fn refresh(&self, board: &Switchboard, clock: &dyn Clock) {
        clock.sleep(self.refresh);
        self.maintain(board);
    }
}

/// Engages the fail-safe when dropped, unless disarmed. Covers early
/// returns and unwinding out of the session loop.
pub struct SafetyGuard {
    board: Switchboard,
    armed: bool,
}

impl SafetyGuard {
    pub fn new(board: Switchboard) -> Self {
        Self { board, armed: true }
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }
}

impl Drop for SafetyGuard {
    fn drop(&mut self) {
        if self.armed {
            error!("session loop exited unexpectedly, engaging fail-safe");
            FailSafe::engage(&self.board);
        }
    }
}

/// Exit status after a termination signal, as a shell reports SIGINT.
pub const EXIT_INTERRUPTED: i32 = 130;

/// Resolves on Ctrl-C, or on SIGTERM where the platform has it.
pub async fn termination() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => info!("interrupt received"),
        _ = terminate => info!("terminate received"),
    }
}

/// Blocks until `signal` resolves, then engages the fail-safe.
/// Returns whether every switch was confirmed.
pub fn fail_safe_on<F: Future<Output = ()>>(board: &Switchboard, signal: F) -> io::Result<bool> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(signal);
    error!("session terminated, engaging fail-safe");
    Ok(FailSafe::engage(board))
}

/// Watches for termination on its own thread. On a signal the fail-safe
/// is engaged and the process exits with [`EXIT_INTERRUPTED`].
pub fn spawn_signal_guard(board: Switchboard) -> io::Result<()> {
    std::thread::Builder::new()
        .name("signals".into())
        .spawn(move || match fail_safe_on(&board, termination()) {
            Ok(confirmed) => {
                if !confirmed {
                    warn!("fail-safe not fully confirmed before exit");
                }
                std::process::exit(EXIT_INTERRUPTED);
            }
            Err(e) => error!(error = %e, "signal watcher failed to start"),
        })?;
    Ok(())
}
