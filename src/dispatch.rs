use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::devices::{Stimulator, Stimulus};

enum Queue {
    Worker {
        tx: Option<Sender<Stimulus>>,
        done: Receiver<()>,
    },
    Inline(Arc<dyn Stimulator>),
}

/// Fire-and-forget stimulation.
///
/// `dispatch` never blocks and never reports failure; the worker logs every
/// rejected pulse. `shutdown` gives queued pulses a bounded window to drain.
pub struct StimulusDispatcher {
    queue: Queue,
    dispatched: AtomicU64,
}

impl StimulusDispatcher {
    /// Spawns the worker thread that owns the stimulator.
    pub fn spawn(stimulator: Arc<dyn Stimulator>) -> io::Result<Self> {
        let (tx, rx) = mpsc::channel::<Stimulus>();
        let (done_tx, done) = mpsc::channel();
        std::thread::Builder::new()
            .name("stimulus".into())
            .spawn(move || {
                for stimulus in rx {
                    if let Err(e) = stimulator.stimulate(stimulus) {
                        warn!(mode = %stimulus.mode, error = %e, "stimulus failed");
                    }
                }
                let _ = done_tx.send(());
            })?;
        Ok(Self {
            queue: Queue::Worker { tx: Some(tx), done },
            dispatched: AtomicU64::new(0),
        })
    }

    /// Calls the stimulator on the caller's thread. Used with simulated rigs.
    pub fn inline(stimulator: Arc<dyn Stimulator>) -> Self {
        Self {
            queue: Queue::Inline(stimulator),
            dispatched: AtomicU64::new(0),
        }
    }

    pub fn dispatch(&self, stimulus: Stimulus) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        match &self.queue {
            Queue::Worker { tx: Some(tx), .. } => {
                if tx.send(stimulus).is_err() {
                    warn!(mode = %stimulus.mode, "stimulus worker gone, pulse dropped");
                }
            }
            Queue::Worker { tx: None, .. } => {
                debug!(mode = %stimulus.mode, "dispatcher shut down, pulse dropped");
            }
            Queue::Inline(stimulator) => {
                if let Err(e) = stimulator.stimulate(stimulus) {
                    warn!(mode = %stimulus.mode, error = %e, "stimulus failed");
                }
            }
        }
    }

    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// Closes the queue and waits at most `grace` for the worker to drain.
    /// Returns true when the queue drained in time.
    pub fn shutdown(&mut self, grace: Duration) -> bool {
        match &mut self.queue {
            Queue::Worker { tx, done } => {
                tx.take();
                done.recv_timeout(grace).is_ok()
            }
            Queue::Inline(_) => true,
        }
    }
}
