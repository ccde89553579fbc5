use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::devices::{Device, HardwareStatus};

/// Health check for one device; must not change its visible state.
pub trait DeviceCheck: Send + Sync {
    fn is_reachable(&self, device: Device) -> bool;
}

/// Background task that keeps [`HardwareStatus`] current. It is the only
/// writer of the flags; the session loop only reads them.
pub struct ReconnectMonitor {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ReconnectMonitor {
    pub fn spawn(
        check: Arc<dyn DeviceCheck>,
        status: Arc<HardwareStatus>,
        interval: Duration,
    ) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = std::thread::Builder::new()
            .name("reconnect-monitor".into())
            .spawn(move || {
                info!(interval_secs = interval.as_secs_f64(), "hardware monitoring started");
                while !flag.load(Ordering::Acquire) {
                    Self::sweep(check.as_ref(), &status);
                    let until = Instant::now() + interval;
                    while Instant::now() < until && !flag.load(Ordering::Acquire) {
                        std::thread::sleep(Duration::from_millis(50).min(interval));
                    }
                }
                info!("hardware monitoring stopped");
            })?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// One pass over every device. Returns how many came back online.
    pub fn sweep(check: &dyn DeviceCheck, status: &HardwareStatus) -> usize {
        let mut reconnected = 0;
        for device in Device::all() {
            let online = check.is_reachable(device);
            if !status.mark(device, online) {
                continue;
            }
            if online {
                info!(%device, "device reconnected");
                reconnected += 1;
            } else {
                warn!(%device, "device went offline");
            }
        }
        debug!(offline = status.offline().len(), "hardware sweep complete");
        reconnected
    }

    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ReconnectMonitor {
    fn drop(&mut self) {
        self.halt();
    }
}
