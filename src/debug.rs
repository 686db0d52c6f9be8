//! Process-wide debug level, read atomically by every hot path.
//!
//! A single shared level, not a per-call parameter. Bridged to
//! `log::LevelFilter` so the `cli` feature's `simplelog` output honors it.

use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum DebugLevel {
    None = 0,
    Error = 1,
    Info = 2,
    Debug = 3,
}

impl DebugLevel {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => DebugLevel::None,
            1 => DebugLevel::Error,
            2 => DebugLevel::Info,
            _ => DebugLevel::Debug,
        }
    }

    pub fn to_level_filter(self) -> log::LevelFilter {
        match self {
            DebugLevel::None => log::LevelFilter::Off,
            DebugLevel::Error => log::LevelFilter::Error,
            DebugLevel::Info => log::LevelFilter::Info,
            DebugLevel::Debug => log::LevelFilter::Debug,
        }
    }
}

static LEVEL: AtomicU8 = AtomicU8::new(DebugLevel::Error as u8);

pub fn set_debug_level(level: DebugLevel) {
    LEVEL.store(level as u8, Ordering::Relaxed);
    log::set_max_level(level.to_level_filter());
}

pub fn debug_level() -> DebugLevel {
    DebugLevel::from_u8(LEVEL.load(Ordering::Relaxed))
}
