//! Bootstrap capability delegation (spec component C7): handle 0 as the
//! well-known receive endpoint every spawned server inherits from init.

use std::fmt::Write as _;
use std::thread;
use std::time::Duration;

use viper_abi::HANDLE_BOOTSTRAP;

use crate::channel::{Endpoint, Message};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_micros(200);

/// The bootstrap receive endpoint a freshly spawned server is handed at
/// `HANDLE_BOOTSTRAP` (0). Distinct from an ordinary `Channel` type so a
/// server cannot accidentally treat it as just another IPC endpoint.
pub struct BootstrapChannel {
    endpoint: Endpoint,
}

impl BootstrapChannel {
    pub fn new(endpoint: Endpoint) -> Self {
        debug_assert_eq!(HANDLE_BOOTSTRAP, 0);
        BootstrapChannel { endpoint }
    }

    /// Polls up to `max_iters` times for the delegated capability bundle,
    /// yielding between attempts. Returns `None` if nothing arrived —
    /// callers fall back to legacy assign-registry discovery unless
    /// `viper_abi::config::strict_bootstrap()` is set, in which case a
    /// missing bundle is an initialization failure.
    pub fn accept(&self, max_iters: usize) -> Option<Message> {
        for _ in 0..max_iters {
            match self.endpoint.try_recv() {
                Ok(message) => return Some(message),
                Err(_) => thread::sleep(ACCEPT_POLL_INTERVAL),
            }
        }
        viper_log::warn("bootstrap", |l| {
            let _ = write!(l, "no bundle delegated after {max_iters} polls");
        });
        None
    }
}
