//! Global flags shared across the library's lifetime.

use std::sync::atomic::{AtomicBool, Ordering};

/// A simple atomic flag, used to track one-shot global init/deinit.
pub struct Flag(AtomicBool);

impl Flag {
    /// Creates a new, unset flag.
    pub const fn new() -> Self {
        Flag(AtomicBool::new(false))
    }

    /// Checks if the flag is set.
    pub fn test(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Sets the flag.
    pub fn set(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Unsets the flag.
    pub fn unset(&self) {
        self.0.store(false, Ordering::Relaxed);
    }
}
