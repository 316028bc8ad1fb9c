//! Level-triggered readiness multiplexer (spec component C4).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use viper_abi::{Handle, VError};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PollMask: u32 {
        const SEND = 1 << 0;
        const RECV = 1 << 1;
        const HUP  = 1 << 2;
        /// A timer armed with `Timer::new` has reached its deadline.
        const TIMER = 1 << 3;
        /// The console pseudo-handle (`viper_abi::CONSOLE_INPUT`) has a
        /// byte waiting.
        const CONSOLE_INPUT = 1 << 4;
    }
}

/// Anything a poll set can watch for readiness.
pub trait Pollable: Send + Sync {
    fn readiness(&self) -> PollMask;
}

/// A one-shot or periodic deadline, watchable through a poll set. Readiness
/// is level-triggered like every other `Pollable`: once the deadline has
/// passed it stays `TIMER`-ready until `rearm` pushes it into the future
/// again.
pub struct Timer {
    deadline: Mutex<Instant>,
}

impl Timer {
    pub fn new(after: Duration) -> Self {
        Timer { deadline: Mutex::new(Instant::now() + after) }
    }

    pub fn rearm(&self, after: Duration) {
        *self.deadline.lock() = Instant::now() + after;
    }
}

impl Pollable for Timer {
    fn readiness(&self) -> PollMask {
        if Instant::now() >= *self.deadline.lock() { PollMask::TIMER } else { PollMask::empty() }
    }
}

/// Backs the console pseudo-handle (`viper_abi::CONSOLE_INPUT`): a process
/// that owns stdin flips this when a byte becomes available, and clears it
/// once consumed. Arming a poll set on `CONSOLE_INPUT` wraps this shared
/// flag rather than a channel endpoint.
#[derive(Default)]
pub struct ConsoleSignal {
    ready: AtomicBool,
}

impl ConsoleSignal {
    pub fn new() -> Self {
        ConsoleSignal { ready: AtomicBool::new(false) }
    }

    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    pub fn clear(&self) {
        self.ready.store(false, Ordering::Release);
    }
}

impl Pollable for ConsoleSignal {
    fn readiness(&self) -> PollMask {
        if self.ready.load(Ordering::Acquire) { PollMask::CONSOLE_INPUT } else { PollMask::empty() }
    }
}

struct Entry {
    handle_raw: u32,
    requested: PollMask,
    target: Arc<dyn Pollable>,
}

pub struct PollSetObject;
pub type PollSetHandle = Handle<PollSetObject>;

/// A set of watched handles plus their requested interest masks.
pub struct PollSet {
    entries: Mutex<Vec<Entry>>,
}

const SPIN_INTERVAL: Duration = Duration::from_micros(200);

impl Default for PollSet {
    fn default() -> Self {
        Self::new()
    }
}

impl PollSet {
    pub fn new() -> Self {
        PollSet { entries: Mutex::new(Vec::new()) }
    }

    pub fn arm(&self, handle_raw: u32, requested: PollMask, target: Arc<dyn Pollable>) {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.iter_mut().find(|e| e.handle_raw == handle_raw) {
            existing.requested = requested;
            existing.target = target;
        } else {
            entries.push(Entry { handle_raw, requested, target });
        }
    }

    pub fn disarm(&self, handle_raw: u32) -> Result<(), VError> {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| e.handle_raw != handle_raw);
        if entries.len() == before {
            return Err(VError::InvalidHandle);
        }
        Ok(())
    }

    fn scan(&self) -> Vec<(u32, PollMask)> {
        self.entries
            .lock()
            .iter()
            .filter_map(|e| {
                let ready = e.target.readiness() & e.requested;
                if ready.is_empty() { None } else { Some((e.handle_raw, ready)) }
            })
            .collect()
    }

    /// Blocks (per `timeout_ms`'s sign/value convention: negative =
    /// forever, 0 = non-blocking, positive = bounded milliseconds) until at
    /// least one armed handle's requested interest is satisfied, or the
    /// timeout elapses.
    pub fn poll_wait(&self, timeout_ms: i64) -> Vec<(u32, PollMask)> {
        let ready = self.scan();
        if !ready.is_empty() || timeout_ms == 0 {
            return ready;
        }
        let deadline = (timeout_ms > 0).then(|| Instant::now() + Duration::from_millis(timeout_ms as u64));
        loop {
            thread::sleep(SPIN_INTERVAL);
            let ready = self.scan();
            if !ready.is_empty() {
                return ready;
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Vec::new();
                }
            }
        }
    }
}
