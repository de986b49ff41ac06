//! Admission control for backend executions.
//!
//! A fixed-capacity counting gate: [`AdmissionController::try_acquire`] never
//! waits. Either a slot is free and an [`AdmissionSlot`] is handed out, or the
//! caller is turned away and must not touch the backend.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::debug;

#[derive(Debug)]
struct Gate {
    capacity: usize,
    in_flight: AtomicUsize,
}

/// Cheap to clone; all clones share the same counter.
#[derive(Debug, Clone)]
pub struct AdmissionController {
    gate: Arc<Gate>,
}

impl AdmissionController {
    pub fn new(capacity: usize) -> Self {
        Self {
            gate: Arc::new(Gate {
                capacity,
                in_flight: AtomicUsize::new(0),
            }),
        }
    }

    /// Try to take a slot without blocking or queueing.
    pub fn try_acquire(&self) -> Option<AdmissionSlot> {
        let capacity = self.gate.capacity;
        let admitted = self
            .gate
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < capacity).then_some(n + 1)
            })
            .is_ok();

        if admitted {
            Some(AdmissionSlot {
                gate: Arc::clone(&self.gate),
                released: false,
            })
        } else {
            debug!(capacity, "admission rejected");
            None
        }
    }

    pub fn in_flight(&self) -> usize {
        self.gate.in_flight.load(Ordering::SeqCst)
    }

    pub fn capacity(&self) -> usize {
        self.gate.capacity
    }
}

/// An execution permit. Owned by exactly one in-flight request.
///
/// The slot goes back to the pool on the first call to [`release`] or on drop,
/// whichever comes first. Moving the slot into a response stream ties its
/// lifetime to the stream, so a client disconnect releases it too.
///
/// [`release`]: AdmissionSlot::release
#[derive(Debug)]
pub struct AdmissionSlot {
    gate: Arc<Gate>,
    released: bool,
}

impl AdmissionSlot {
    pub fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.gate.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_exactly_capacity() {
        let gate = AdmissionController::new(2);

        let _a = gate.try_acquire().unwrap();
        let _b = gate.try_acquire().unwrap();
        assert!(gate.try_acquire().is_none());
        assert_eq!(gate.in_flight(), 2);
    }

    #[test]
    fn one_release_admits_one_more() {
        let gate = AdmissionController::new(2);
        let a = gate.try_acquire().unwrap();
        let _b = gate.try_acquire().unwrap();

        drop(a);
        let _c = gate.try_acquire().unwrap();
        assert!(gate.try_acquire().is_none());
    }

    #[test]
    fn release_is_idempotent() {
        let gate = AdmissionController::new(1);
        let mut slot = gate.try_acquire().unwrap();

        slot.release();
        slot.release();
        assert_eq!(gate.in_flight(), 0);

        drop(slot);
        assert_eq!(gate.in_flight(), 0);

        let _again = gate.try_acquire().unwrap();
        assert_eq!(gate.in_flight(), 1);
    }

    #[test]
    fn clones_share_the_pool() {
        let gate = AdmissionController::new(1);
        let other = gate.clone();

        let _slot = gate.try_acquire().unwrap();
        assert!(other.try_acquire().is_none());
        assert_eq!(other.in_flight(), 1);
    }

    #[test]
    fn concurrent_acquires_never_exceed_capacity() {
        let gate = AdmissionController::new(4);
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let gate = gate.clone();
                std::thread::spawn(move || gate.try_acquire())
            })
            .collect();

        let slots: Vec<_> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(slots.len(), 4);
        assert_eq!(gate.in_flight(), 4);

        drop(slots);
        assert_eq!(gate.in_flight(), 0);
    }
}
