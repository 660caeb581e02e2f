//! Single-flight gate for consolidation runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared flag guaranteeing at most one run in flight. Clones share the flag.
#[derive(Debug, Clone, Default)]
pub struct RunGate {
    running: Arc<AtomicBool>,
}

/// Holds the gate; releases it on drop.
#[derive(Debug)]
pub struct RunGuard {
    running: Arc<AtomicBool>,
}

impl RunGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the gate in one compare-and-swap, or `None` if a run is in flight.
    pub fn try_acquire(&self) -> Option<RunGuard> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunGuard {
                running: Arc::clone(&self.running),
            })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl RunGuard {
    /// Release explicitly. Equivalent to dropping the guard.
    pub fn release(self) {}
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_until_release() {
        let gate = RunGate::new();
        let shared = gate.clone();

        let guard = gate.try_acquire().unwrap();
        assert!(shared.is_running());
        assert!(shared.try_acquire().is_none());

        guard.release();
        assert!(!gate.is_running());
        assert!(shared.try_acquire().is_some());
    }

    #[test]
    fn concurrent_acquires_admit_exactly_one() {
        let gate = RunGate::new();
        let barrier = Arc::new(std::sync::Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gate = gate.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    // Keep the guard alive until every thread has tried.
                    let guard = gate.try_acquire();
                    let won = guard.is_some();
                    std::thread::sleep(std::time::Duration::from_millis(200));
                    drop(guard);
                    won
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
