//! Bring-up knobs read once from the environment, mirroring the teacher's
//! `selftest_*`/`INIT_LITE_LOG_TOPICS`-style cfg/env bring-up switches.

#![cfg(feature = "std")]

/// Default channel FIFO depth (§4.2); overridable for tests that want to
/// exercise `WouldBlock`/drop behavior at a smaller depth.
pub const DEFAULT_CHANNEL_FIFO_DEPTH: usize = 8;

/// Reads `VIPER_CHANNEL_FIFO_DEPTH`, falling back to the default on any
/// missing or unparsable value.
pub fn channel_fifo_depth() -> usize {
    std::env::var("VIPER_CHANNEL_FIFO_DEPTH")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_CHANNEL_FIFO_DEPTH)
}

/// Whether bootstrap delegation should refuse to fall back to legacy
/// assign-registry discovery when handle 0 carries no capabilities.
pub fn strict_bootstrap() -> bool {
    std::env::var("VIPER_STRICT_BOOTSTRAP")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}
