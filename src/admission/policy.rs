//! Admission policy.

use std::time::Duration;

/// Default minimum interval between admitted requests from one client.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(1);

/// Immutable admission policy for a filter instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    window: Duration,
}

impl Policy {
    /// Create a policy with the given window. A zero window admits everything.
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    /// Minimum interval between two admitted requests from the same client.
    pub fn window(&self) -> Duration {
        self.window
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}
