//! Bus lifecycle with in-flight dispatch tracking.
//!
//! Uses `ArcSwap` for lock-free state transitions and an atomic counter with RAII
//! guards so `Bus::shutdown` can wait for handlers that are still running.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;

/// Bus lifecycle state.
///
/// State machine: Starting -> Running -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    /// Topology is being declared; deliveries are not dispatched yet.
    Starting,
    /// Deliveries are dispatched to handlers.
    Running,
    /// Shutdown requested; new deliveries are rejected back to the broker.
    Draining,
    /// Every in-flight dispatch has finished.
    Stopped,
}

/// Tracks the bus state and the number of deliveries currently being handled.
#[derive(Debug)]
pub struct LifecycleController {
    in_flight: Arc<AtomicU64>,
    state: ArcSwap<BusState>,
}

impl LifecycleController {
    /// Creates a controller in the `Starting` state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(AtomicU64::new(0)),
            state: ArcSwap::from_pointee(BusState::Starting),
        }
    }

    pub fn set_running(&self) {
        self.state.store(Arc::new(BusState::Running));
    }

    /// Moves to `Draining`. Returns `false` if the bus was already draining or stopped.
    pub fn begin_drain(&self) -> bool {
        let previous = self.state.rcu(|current| {
            if matches!(**current, BusState::Draining | BusState::Stopped) {
                Arc::clone(current)
            } else {
                Arc::new(BusState::Draining)
            }
        });
        !matches!(*previous, BusState::Draining | BusState::Stopped)
    }

    #[must_use]
    pub fn state(&self) -> BusState {
        **self.state.load()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == BusState::Running
    }

    /// Counts one dispatch as in flight until the guard is dropped, including on
    /// panic unwinding.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Waits for in-flight dispatches to finish, up to `timeout`.
    ///
    /// Returns `true` and moves to `Stopped` once the count reaches zero. Returns
    /// `false` if the timeout expired; the state stays `Draining`.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.in_flight.load(Ordering::Relaxed) == 0 {
                self.state.store(Arc::new(BusState::Stopped));
                return true;
            }

            if tokio::time::Instant::now() >= deadline {
                return false;
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for LifecycleController {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that decrements the in-flight counter when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions_starting_running_draining() {
        let controller = LifecycleController::new();
        assert_eq!(controller.state(), BusState::Starting);
        assert!(!controller.is_running());

        controller.set_running();
        assert!(controller.is_running());

        assert!(controller.begin_drain());
        assert_eq!(controller.state(), BusState::Draining);
        assert!(!controller.begin_drain());
    }

    #[test]
    fn in_flight_guard_counts() {
        let controller = LifecycleController::new();
        let a = controller.in_flight_guard();
        let b = controller.in_flight_guard();
        assert_eq!(controller.in_flight_count(), 2);
        drop(a);
        drop(b);
        assert_eq!(controller.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn drain_waits_for_guards() {
        let controller = LifecycleController::new();
        controller.set_running();
        let guard = controller.in_flight_guard();
        controller.begin_drain();

        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            drop(guard);
        });

        assert!(controller.wait_for_drain(Duration::from_secs(2)).await);
        assert_eq!(controller.state(), BusState::Stopped);
        release.await.unwrap();
    }

    #[tokio::test]
    async fn drain_times_out_with_stuck_dispatch() {
        let controller = LifecycleController::new();
        let _guard = controller.in_flight_guard();
        controller.begin_drain();

        assert!(!controller.wait_for_drain(Duration::from_millis(30)).await);
        assert_eq!(controller.state(), BusState::Draining);
    }

    #[test]
    fn stopped_state_never_flickers_under_concurrent_drains() {
        let controller = Arc::new(LifecycleController::new());
        controller.state.store(Arc::new(BusState::Stopped));

        let drainer = {
            let controller = Arc::clone(&controller);
            std::thread::spawn(move || {
                for _ in 0..10_000 {
                    assert!(!controller.begin_drain());
                }
            })
        };
        for _ in 0..10_000 {
            assert_eq!(controller.state(), BusState::Stopped);
        }
        drainer.join().unwrap();
    }

    #[test]
    fn only_one_concurrent_drain_wins() {
        let controller = Arc::new(LifecycleController::new());
        controller.set_running();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let controller = Arc::clone(&controller);
                std::thread::spawn(move || controller.begin_drain())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(controller.state(), BusState::Draining);
    }

    #[test]
    fn stopped_bus_cannot_drain_again() {
        let controller = LifecycleController::new();
        controller.begin_drain();
        controller.state.store(Arc::new(BusState::Stopped));
        assert!(!controller.begin_drain());
        assert_eq!(controller.state(), BusState::Stopped);
    }
}
