use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::{timeout, Duration};

/// Exclusive-access gate in front of the plotter.
///
/// The physical device cannot execute two command programs at once, so every
/// device-touching operation runs while holding a [`GatePass`]. Acquisition is
/// bounded-wait: a request that cannot get the gate quickly is told "busy"
/// instead of hanging.
#[derive(Clone)]
pub struct DeviceGate {
    inner: Arc<Mutex<()>>,
}

/// Proof of exclusive device access. The gate is released when this is
/// dropped, so release happens on every exit path.
pub struct GatePass {
    _permit: OwnedMutexGuard<()>,
}

impl DeviceGate {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(())),
        }
    }

    /// Wait up to `wait` for exclusive access. Returns `None` if the device
    /// is still busy when the wait elapses; nothing is mutated in that case.
    pub async fn acquire(&self, wait: Duration) -> Option<GatePass> {
        match timeout(wait, self.inner.clone().lock_owned()).await {
            Ok(permit) => Some(GatePass { _permit: permit }),
            Err(_) => None,
        }
    }
}
