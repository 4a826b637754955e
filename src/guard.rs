//! Single-flight execution guard with cooperative cancellation.
//!
//! At most one flight is in progress per guard. A second caller is refused
//! rather than queued, and the in-flight holder can be cancelled through the
//! token it registered on acquisition.

use std::sync::{Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;

/// Guard state: `Some(token)` while a flight is running, `None` when idle.
#[derive(Debug, Default)]
pub struct SingleFlight {
    state: Mutex<Option<CancellationToken>>,
}

/// Proof of a successful [`SingleFlight::try_acquire`]. Releases the guard
/// when dropped.
#[derive(Debug)]
pub struct Flight<'a> {
    guard: &'a SingleFlight,
    token: CancellationToken,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        // The critical sections never panic, but a poisoned lock still holds
        // a consistent Option.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Transition Idle -> Running, registering `token` as the cancel handle.
    /// Returns `None` if a flight is already in progress.
    pub fn try_acquire(&self, token: CancellationToken) -> Option<Flight<'_>> {
        let mut state = self.lock();
        if state.is_some() {
            return None;
        }
        *state = Some(token.clone());
        Some(Flight { guard: self, token })
    }

    fn release(&self) {
        self.lock().take();
    }

    /// Cancel the in-flight run, if any.
    pub fn cancel(&self) {
        if let Some(token) = self.lock().as_ref() {
            token.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock().is_some()
    }
}

impl Flight<'_> {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Transition Running -> Idle. Equivalent to dropping the flight.
    pub fn release(self) {}
}

impl Drop for Flight<'_> {
    fn drop(&mut self) {
        self.guard.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_is_refused() {
        let guard = SingleFlight::new();
        let first = guard.try_acquire(CancellationToken::new());
        assert!(first.is_some());
        assert!(guard.is_running());
        assert!(guard.try_acquire(CancellationToken::new()).is_none());
    }

    #[test]
    fn test_drop_releases() {
        let guard = SingleFlight::new();
        {
            let _flight = guard.try_acquire(CancellationToken::new()).unwrap();
        }
        assert!(!guard.is_running());

        let flight = guard.try_acquire(CancellationToken::new()).unwrap();
        flight.release();
        assert!(!guard.is_running());
        assert!(guard.try_acquire(CancellationToken::new()).is_some());
    }

    #[test]
    fn test_cancel_reaches_holder() {
        let guard = SingleFlight::new();
        let flight = guard.try_acquire(CancellationToken::new()).unwrap();
        guard.cancel();
        assert!(flight.token().is_cancelled());
    }

    #[test]
    fn test_cancel_when_idle_is_noop() {
        let guard = SingleFlight::new();
        guard.cancel();
        guard.cancel();
        assert!(!guard.is_running());

        let flight = guard.try_acquire(CancellationToken::new()).unwrap();
        assert!(!flight.token().is_cancelled());
    }
}
