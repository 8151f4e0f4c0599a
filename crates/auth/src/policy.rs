//! When a credential counts as "nearing expiry"
//!
//! A credential is refreshed once its remaining lifetime drops below the
//! refresh window, not only when it has expired. The window is either fixed
//! or derived from the credential's total lifetime.

use std::time::Duration;

use crate::credential::Credential;

/// Refresh window policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshWindow {
    /// Same window regardless of lifetime
    Fixed(Duration),
    /// `clamp(lifetime - margin, floor, ceiling)`
    Derived {
        margin: Duration,
        floor: Duration,
        ceiling: Duration,
    },
}

impl Default for RefreshWindow {
    fn default() -> Self {
        RefreshWindow::Derived {
            margin: Duration::from_secs(60),
            floor: Duration::from_secs(60),
            ceiling: Duration::from_secs(240),
        }
    }
}

impl RefreshWindow {
    /// Window applying to a credential with the given total lifetime.
    ///
    /// A floor above the ceiling resolves to the ceiling.
    pub fn window_for(&self, lifetime: Duration) -> Duration {
        match *self {
            RefreshWindow::Fixed(window) => window,
            RefreshWindow::Derived {
                margin,
                floor,
                ceiling,
            } => lifetime.saturating_sub(margin).max(floor).min(ceiling),
        }
    }

    /// Whether `credential` should be refreshed at `now` (unix millis).
    pub fn needs_refresh(&self, credential: &Credential, now: u64) -> bool {
        credential.remaining(now) < self.window_for(credential.lifetime())
    }
}
