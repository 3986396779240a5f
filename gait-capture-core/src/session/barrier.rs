use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Outcome of a barrier wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierWait {
    /// Every party arrived; all waiters were released together.
    Released,
    /// The bounded wait elapsed (or another waiter's did) before all
    /// parties arrived.
    Broken,
}

struct BarrierState {
    arrived: usize,
    released: bool,
    broken: bool,
}

/// Single-use counting barrier with a bounded wait.
///
/// The commit threads of a synchronized recording start rendezvous here:
/// each arrives only after finishing its own slow preparation, and the
/// release happens for all of them in the same instant, so the actual
/// device-start calls land within milliseconds of each other.
///
/// A waiter whose timeout elapses marks the barrier broken and wakes the
/// others; a broken barrier degrades that camera's commit to a failure
/// instead of hanging the session.
pub struct CommitBarrier {
    parties: usize,
    state: Mutex<BarrierState>,
    cond: Condvar,
}

impl CommitBarrier {
    pub fn new(parties: usize) -> Self {
        Self {
            parties,
            state: Mutex::new(BarrierState {
                arrived: 0,
                released: false,
                broken: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn parties(&self) -> usize {
        self.parties
    }

    /// Block until all parties have arrived or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> BarrierWait {
        let mut state = self.state.lock();
        if state.broken {
            return BarrierWait::Broken;
        }

        state.arrived += 1;
        if state.arrived >= self.parties {
            state.released = true;
            self.cond.notify_all();
            return BarrierWait::Released;
        }

        let deadline = Instant::now() + timeout;
        loop {
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                if state.released {
                    return BarrierWait::Released;
                }
                state.broken = true;
                self.cond.notify_all();
                return BarrierWait::Broken;
            }
            if state.released {
                return BarrierWait::Released;
            }
            if state.broken {
                return BarrierWait::Broken;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn releases_all_parties_together() {
        let barrier = Arc::new(CommitBarrier::new(3));
        let mut handles = Vec::new();

        for _ in 0..3 {
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                let result = barrier.wait(Duration::from_secs(2));
                (result, Instant::now())
            }));
        }

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(results.iter().all(|(r, _)| *r == BarrierWait::Released));

        // Release instants cluster tightly.
        let times: Vec<Instant> = results.iter().map(|(_, t)| *t).collect();
        let earliest = times.iter().min().unwrap();
        let latest = times.iter().max().unwrap();
        assert!(latest.duration_since(*earliest) < Duration::from_millis(200));
    }

    #[test]
    fn missing_party_breaks_barrier_for_everyone() {
        let barrier = Arc::new(CommitBarrier::new(3));
        let mut handles = Vec::new();

        // Only two of three parties ever arrive.
        for _ in 0..2 {
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                barrier.wait(Duration::from_millis(100))
            }));
        }

        for handle in handles {
            assert_eq!(handle.join().unwrap(), BarrierWait::Broken);
        }

        // A straggler arriving later sees the broken barrier immediately.
        assert_eq!(barrier.wait(Duration::from_secs(1)), BarrierWait::Broken);
    }

    #[test]
    fn single_party_releases_immediately() {
        let barrier = CommitBarrier::new(1);
        let started = Instant::now();
        assert_eq!(barrier.wait(Duration::from_secs(1)), BarrierWait::Released);
        assert!(started.elapsed() < Duration::from_millis(50));
    }
}
