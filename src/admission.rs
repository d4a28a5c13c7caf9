//! Concurrency admission control
//!
//! A single atomic counter bounds the number of in-flight executions.
//! Reservations are scoped: the permit releases its slot exactly once,
//! either explicitly or on drop.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Reservation refused; carries the observed counter and the limit.
#[derive(Debug, thiserror::Error)]
#[error("concurrency limit reached: {current} of {limit} executions in flight")]
pub struct Rejected {
    pub current: usize,
    pub limit: usize,
}

/// Shared in-flight counter. The limit is passed at each reserve so a
/// catalog reload takes effect for subsequent submissions.
#[derive(Debug, Clone, Default)]
pub struct AdmissionControl {
    in_flight: Arc<AtomicUsize>,
}

impl AdmissionControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomic test-and-increment against `limit`.
    pub fn reserve(&self, limit: usize) -> Result<AdmissionPermit, Rejected> {
        let mut current = self.in_flight.load(Ordering::SeqCst);
        loop {
            if current >= limit {
                return Err(Rejected { current, limit });
            }
            match self.in_flight.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    return Ok(AdmissionPermit {
                        counter: Arc::clone(&self.in_flight),
                        released: AtomicBool::new(false),
                    });
                }
                Err(observed) => current = observed,
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

/// One reserved slot. Dropping the permit releases the slot; calling
/// [`AdmissionPermit::release`] first is also fine, the slot is only
/// given back once.
#[derive(Debug)]
pub struct AdmissionPermit {
    counter: Arc<AtomicUsize>,
    released: AtomicBool,
}

impl AdmissionPermit {
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.counter.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.release();
    }
}
