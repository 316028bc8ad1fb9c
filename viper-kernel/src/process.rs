//! A simulated process: just enough state (a capability table and a name,
//! for diagnostics) to host the kernel objects a service needs.

use std::sync::Arc;

use crate::captable::CapTable;
use crate::pollset::ConsoleSignal;

pub struct Process {
    pub name: String,
    pub caps: Arc<CapTable>,
    /// Backs the `viper_abi::CONSOLE_INPUT` pseudo-handle when this process
    /// arms a poll set on it — valid only inside poll sets, never a real
    /// channel endpoint.
    pub console: Arc<ConsoleSignal>,
}

impl Process {
    pub fn new(name: impl Into<String>) -> Self {
        Process { name: name.into(), caps: Arc::new(CapTable::new()), console: Arc::new(ConsoleSignal::new()) }
    }
}
