//! One-shot authentication gate.
//!
//! Every worker except the first waits on the gate before taking its first
//! job, so at most one credential prompt happens per batch. The gate moves
//! from armed to released exactly once; releasing again is a no-op.

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
pub struct AuthGate {
    released: Mutex<bool>,
    cond: Condvar,
}

impl AuthGate {
    /// Create an armed gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the gate is released.
    pub fn wait(&self) {
        let mut released = self.released.lock();
        while !*released {
            self.cond.wait(&mut released);
        }
    }

    /// Release every waiter. Returns `true` for the call that opened the gate.
    pub fn release(&self) -> bool {
        let mut released = self.released.lock();
        if *released {
            return false;
        }
        *released = true;
        self.cond.notify_all();
        true
    }

    pub fn is_released(&self) -> bool {
        *self.released.lock()
    }
}

/// Worker 0's hold on the gate. The gate opens when the hold is released or
/// dropped, so a worker that panics mid-job still lets the others run.
pub(crate) struct GateHold<'a> {
    gate: Option<&'a AuthGate>,
}

impl<'a> GateHold<'a> {
    pub(crate) fn new(gate: &'a AuthGate) -> Self {
        GateHold { gate: Some(gate) }
    }

    pub(crate) fn none() -> Self {
        GateHold { gate: None }
    }

    pub(crate) fn gate(&self) -> Option<&'a AuthGate> {
        self.gate
    }

    pub(crate) fn release(&mut self) {
        if let Some(gate) = self.gate.take() {
            gate.release();
        }
    }
}

impl Drop for GateHold<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Handed to a strategy's transfer function. Signalling it tells sibling
/// workers the credential question is settled.
///
/// Only the job that holds the gate gets an armed signal; for every other
/// job `signal` does nothing.
pub struct AuthSignal<'a> {
    gate: Option<&'a AuthGate>,
}

impl<'a> AuthSignal<'a> {
    pub fn armed(gate: &'a AuthGate) -> Self {
        AuthSignal { gate: Some(gate) }
    }

    pub fn inert() -> Self {
        AuthSignal { gate: None }
    }

    pub fn is_armed(&self) -> bool {
        self.gate.is_some()
    }

    /// Open the gate. Safe to call any number of times.
    pub fn signal(&mut self) {
        if let Some(gate) = self.gate.take() {
            if gate.release() {
                tracing::debug!("xfer: authentication settled, releasing workers");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_release_is_idempotent() {
        let gate = AuthGate::new();
        assert!(!gate.is_released());
        assert!(gate.release());
        assert!(!gate.release());
        assert!(gate.is_released());
        // Does not block once released.
        gate.wait();
    }

    #[test]
    fn test_wait_blocks_until_release() {
        let gate = Arc::new(AuthGate::new());
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let gate = gate.clone();
                thread::spawn(move || gate.wait())
            })
            .collect();

        thread::sleep(Duration::from_millis(50));
        assert!(waiters.iter().all(|h| !h.is_finished()));

        let mut signal = AuthSignal::armed(&gate);
        signal.signal();
        signal.signal();
        assert!(!signal.is_armed());

        for w in waiters {
            w.join().unwrap();
        }
    }

    #[test]
    fn test_inert_signal_does_nothing() {
        let gate = AuthGate::new();
        let mut signal = AuthSignal::inert();
        signal.signal();
        assert!(!gate.is_released());
    }
}
