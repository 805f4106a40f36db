//! System memory sampling

use race_vision_common::{ProcessingError, Result};
use sysinfo::System;

/// Source of the available-memory fraction checked while frames load
pub trait MemoryProbe {
    /// Fraction of system memory currently available, in `[0, 1]`
    fn available_fraction(&mut self) -> Result<f64>;
}

/// Reads the host's memory counters
pub struct SystemMemory {
    system: System,
}

impl SystemMemory {
    #[must_use]
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SystemMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemMemory {
    fn available_fraction(&mut self) -> Result<f64> {
        self.system.refresh_memory();
        let total = self.system.total_memory();
        if total == 0 {
            return Err(ProcessingError::Other(
                "Unable to read total system memory".to_string(),
            ));
        }
        Ok(self.system.available_memory() as f64 / total as f64)
    }
}
