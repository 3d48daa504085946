//! Cooperative kill switch. Polled, never pushed.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

pub trait KillSwitch: Send + Sync {
    fn engaged(&self) -> bool;
}

/// Engaged while a marker file exists.
#[derive(Debug, Clone)]
pub struct FileKillSwitch {
    path: PathBuf,
}

impl FileKillSwitch {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl KillSwitch for FileKillSwitch {
    fn engaged(&self) -> bool {
        self.path.exists()
    }
}

/// In-process switch.
#[derive(Debug, Default)]
pub struct FlagKillSwitch {
    flag: AtomicBool,
}

impl FlagKillSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn engage(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

impl KillSwitch for FlagKillSwitch {
    fn engaged(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
