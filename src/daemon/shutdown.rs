//! Cooperative shutdown.
//!
//! One guard, many observers. Dropping (or triggering) the guard disconnects
//! a zero-capacity channel, which every loop observes either at loop top or
//! inside its interruptible sleep, so cancellation latency is bounded by one
//! sleep tick rather than a full interval.

use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded};

pub struct ShutdownGuard {
    _tx: Sender<()>,
}

impl ShutdownGuard {
    /// Explicit trigger; equivalent to dropping the guard.
    pub fn trigger(self) {}
}

#[derive(Clone)]
pub struct Shutdown {
    rx: Receiver<()>,
}

pub fn channel() -> (ShutdownGuard, Shutdown) {
    let (tx, rx) = bounded::<()>(0);
    (ShutdownGuard { _tx: tx }, Shutdown { rx })
}

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Sleep up to `timeout`; returns true if shutdown fired during the wait.
    pub fn sleep(&self, timeout: Duration) -> bool {
        !matches!(self.rx.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_triggered_while_guard_lives() {
        let (guard, shutdown) = channel();
        assert!(!shutdown.is_triggered());
        assert!(!shutdown.sleep(Duration::from_millis(1)));
        drop(guard);
        assert!(shutdown.is_triggered());
    }

    #[test]
    fn sleep_wakes_on_trigger() {
        let (guard, shutdown) = channel();
        let handle = std::thread::spawn(move || shutdown.sleep(Duration::from_secs(30)));
        std::thread::sleep(Duration::from_millis(20));
        guard.trigger();
        assert!(handle.join().expect("join"));
    }

    #[test]
    fn clones_all_observe_trigger() {
        let (guard, shutdown) = channel();
        let other = shutdown.clone();
        drop(guard);
        assert!(shutdown.is_triggered());
        assert!(other.is_triggered());
    }
}
