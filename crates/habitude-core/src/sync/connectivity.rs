//! Connectivity monitor contract.
//!
//! The host platform knows when the network comes and goes; the sync engine
//! only needs the current value and a way to wait for transitions.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Connectivity {
    Available,
    Unavailable,
}

impl Connectivity {
    pub fn is_available(&self) -> bool {
        matches!(self, Connectivity::Available)
    }
}

/// Source of connectivity transitions.
pub trait ConnectivityMonitor: Send + Sync {
    /// Subscribe to the current state and every later change.
    fn observe(&self) -> watch::Receiver<Connectivity>;

    fn current(&self) -> Connectivity {
        *self.observe().borrow()
    }
}

/// Monitor driven by explicit `set` calls.
///
/// Used by hosts that forward platform network callbacks, by the CLI
/// (which assumes the network is there) and by tests.
pub struct ManualConnectivity {
    tx: watch::Sender<Connectivity>,
}

impl ManualConnectivity {
    pub fn new(initial: Connectivity) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Publish a new state. Repeating the current state notifies nobody.
    pub fn set(&self, state: Connectivity) {
        self.tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }
}

impl ConnectivityMonitor for ManualConnectivity {
    fn observe(&self) -> watch::Receiver<Connectivity> {
        self.tx.subscribe()
    }
}
