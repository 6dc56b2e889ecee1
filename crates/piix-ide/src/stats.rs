/// Cap on rate-limited warnings per device.
pub const MAX_LOG_REL_ERRORS: u32 = 1024;

/// Per-device counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stats {
    pub commands: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub flushes: u64,
    pub discards: u64,
    pub redos: u64,
    pub dropped_commands: u64,
    logged_errors: u32,
}

impl Stats {
    /// Returns whether another rate-limited warning may be logged, and consumes one slot.
    pub fn log_budget(&mut self) -> bool {
        if self.logged_errors >= MAX_LOG_REL_ERRORS {
            return false;
        }
        self.logged_errors += 1;
        true
    }

    pub fn logged_errors(&self) -> u32 {
        self.logged_errors
    }
}
