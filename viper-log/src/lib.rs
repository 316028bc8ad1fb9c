//! Ambient structured logging facade shared by the kernel and every
//! service. Independent of the `log`/`env_logger` pair used by binary
//! entry points for their own process-level diagnostics — this facade is
//! for the kernel core and library crates that stay allocation-light and
//! must not assume a global logger has been installed.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

use core::fmt::Write as _;
use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl Level {
    pub fn label(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }

    fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => Level::Error,
            2 => Level::Warn,
            3 => Level::Info,
            4 => Level::Debug,
            5 => Level::Trace,
            _ => return None,
        })
    }
}

static MAX_LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);
static TOPIC_MASK: AtomicU32 = AtomicU32::new(u32::MAX);

const LINE_CAP: usize = 256;

pub fn set_max_level(level: Level) {
    MAX_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn max_level() -> Level {
    Level::from_u8(MAX_LEVEL.load(Ordering::Relaxed)).unwrap_or(Level::Info)
}

pub fn set_topic_mask(mask: u32) {
    TOPIC_MASK.store(mask, Ordering::Relaxed);
}

pub fn level_enabled(level: Level) -> bool {
    level as u8 <= MAX_LEVEL.load(Ordering::Relaxed)
}

pub fn topic_enabled(topic: u32) -> bool {
    TOPIC_MASK.load(Ordering::Relaxed) & topic != 0
}

/// A fixed-capacity line buffer passed to logging closures so callers build
/// a message without heap allocation.
pub struct LineBuilder {
    buf: [u8; LINE_CAP],
    len: usize,
}

impl LineBuilder {
    fn new() -> Self {
        LineBuilder { buf: [0; LINE_CAP], len: 0 }
    }

    pub fn as_str(&self) -> &str {
        core::str::from_utf8(&self.buf[..self.len]).unwrap_or("<non-utf8 log line>")
    }
}

impl core::fmt::Write for LineBuilder {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let space = LINE_CAP - self.len;
        let take = s.len().min(space);
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

fn emit(level: Level, target: &str, build: impl FnOnce(&mut LineBuilder)) {
    if !level_enabled(level) {
        return;
    }
    let mut line = LineBuilder::new();
    build(&mut line);
    sink(level, target, line.as_str());
}

fn emit_topic(level: Level, target: &str, topic: u32, build: impl FnOnce(&mut LineBuilder)) {
    if !level_enabled(level) || !topic_enabled(topic) {
        return;
    }
    let mut line = LineBuilder::new();
    build(&mut line);
    sink(level, target, line.as_str());
}

#[cfg(feature = "std")]
fn sink(level: Level, target: &str, message: &str) {
    eprintln!("[{}] {target}: {message}", level.label());
}

#[cfg(not(feature = "std"))]
fn sink(_level: Level, _target: &str, _message: &str) {}

pub fn error(target: &str, build: impl FnOnce(&mut LineBuilder)) {
    emit(Level::Error, target, build);
}
pub fn warn(target: &str, build: impl FnOnce(&mut LineBuilder)) {
    emit(Level::Warn, target, build);
}
pub fn info(target: &str, build: impl FnOnce(&mut LineBuilder)) {
    emit(Level::Info, target, build);
}
pub fn debug(target: &str, build: impl FnOnce(&mut LineBuilder)) {
    emit(Level::Debug, target, build);
}
pub fn trace(target: &str, build: impl FnOnce(&mut LineBuilder)) {
    emit(Level::Trace, target, build);
}

pub fn error_topic(target: &str, topic: u32, build: impl FnOnce(&mut LineBuilder)) {
    emit_topic(Level::Error, target, topic, build);
}
pub fn info_topic(target: &str, topic: u32, build: impl FnOnce(&mut LineBuilder)) {
    emit_topic(Level::Info, target, topic, build);
}

/// Initializes the facade from `VIPER_LOG` (a level name: error/warn/info/
/// debug/trace), the way teacher binaries call `env_logger::init()`.
#[cfg(feature = "std")]
pub fn init_from_env() {
    let level = std::env::var("VIPER_LOG")
        .ok()
        .and_then(|v| match v.to_ascii_lowercase().as_str() {
            "error" => Some(Level::Error),
            "warn" => Some(Level::Warn),
            "info" => Some(Level::Info),
            "debug" => Some(Level::Debug),
            "trace" => Some(Level::Trace),
            _ => None,
        })
        .unwrap_or(Level::Info);
    set_max_level(level);
}

#[macro_export]
macro_rules! log_line {
    ($line:expr, $($arg:tt)*) => {{
        let _ = write!($line, $($arg)*);
    }};
}
