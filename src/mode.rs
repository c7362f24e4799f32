//! Process-wide ingestion mode state.

use parking_lot::RwLock;
use tracing::info;

use crate::models::Mode;

/// Holds the current ingestion mode behind a read-preferring lock.
///
/// The ingestion supervisor observes this periodically and (re)starts the
/// matching source set; the HTTP layer writes it.
pub struct ModeController {
    current: RwLock<Mode>,
}

impl ModeController {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Mode::Live),
        }
    }

    pub fn get(&self) -> Mode {
        *self.current.read()
    }

    pub fn set(&self, mode: Mode) {
        let mut current = self.current.write();
        if *current != mode {
            info!(mode = %mode.as_str(), "Mode switched");
        }
        *current = mode;
    }
}

impl Default for ModeController {
    fn default() -> Self {
        Self::new()
    }
}
