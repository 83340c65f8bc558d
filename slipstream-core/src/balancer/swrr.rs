//! Smooth weighted round-robin backend selection.
//!
//! Classic Nginx-style smooth weighting: every selection round credits each
//! healthy backend with its static weight, picks the backend with the highest
//! accumulated weight, then debits the winner by the total weight of the
//! round. Over time each backend is chosen in proportion to its weight, and
//! consecutive picks interleave instead of clustering on the heaviest node.

use parking_lot::Mutex;

use crate::domain::backend::SharedBackend;
use crate::error::Error;

/// Per-backend selection state. `current_weight` is only ever touched while
/// holding the balancer lock.
struct Slot {
    backend: SharedBackend,
    current_weight: i64,
}

/// A smooth weighted round-robin balancer over a pool of backends.
///
/// All operations are safe to call concurrently; selection runs under a
/// single exclusive lock over the pool.
pub struct SwrrBalancer {
    slots: Mutex<Vec<Slot>>,
}

impl SwrrBalancer {
    /// Create an empty balancer.
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
        }
    }

    /// Append a backend to the pool. Its accumulator starts at zero.
    pub fn add_backend(&self, backend: SharedBackend) {
        let mut slots = self.slots.lock();
        slots.push(Slot {
            backend,
            current_weight: 0,
        });
    }

    /// Remove the backend with the given URL. Returns `false` when no
    /// backend matches.
    pub fn remove_backend(&self, url: &str) -> bool {
        let mut slots = self.slots.lock();
        match slots.iter().position(|slot| slot.backend.url() == url) {
            Some(index) => {
                slots.remove(index);
                true
            }
            None => false,
        }
    }

    /// Flip the health flag of the backend with the given URL. Returns
    /// `false` when no backend matches.
    ///
    /// The accumulated `current_weight` is deliberately left untouched on
    /// liveness transitions so a recovering backend re-enters the rotation
    /// at its previous position instead of starving.
    pub fn set_healthy(&self, url: &str, healthy: bool) -> bool {
        let slots = self.slots.lock();
        for slot in slots.iter() {
            if slot.backend.url() == url {
                slot.backend.set_healthy(healthy);
                return true;
            }
        }
        false
    }

    /// Snapshot of all backends in insertion order.
    pub fn backends(&self) -> Vec<SharedBackend> {
        let slots = self.slots.lock();
        slots.iter().map(|slot| slot.backend.clone()).collect()
    }

    /// Number of backends currently marked healthy.
    pub fn healthy_count(&self) -> usize {
        let slots = self.slots.lock();
        slots
            .iter()
            .filter(|slot| slot.backend.is_healthy())
            .count()
    }

    /// Select the next backend.
    ///
    /// Returns [`Error::NoHealthyBackends`] when the pool is empty or every
    /// backend is marked down.
    pub fn next(&self) -> Result<SharedBackend, Error> {
        let mut slots = self.slots.lock();

        if slots.is_empty() {
            return Err(Error::NoHealthyBackends);
        }

        let mut total: i64 = 0;
        for slot in slots.iter_mut() {
            if !slot.backend.is_healthy() {
                continue;
            }
            total += i64::from(slot.backend.weight());
            slot.current_weight += i64::from(slot.backend.weight());
        }

        if total == 0 {
            return Err(Error::NoHealthyBackends);
        }

        // Strict comparison keeps the earliest-inserted backend on ties.
        let mut best: Option<usize> = None;
        for index in 0..slots.len() {
            if !slots[index].backend.is_healthy() {
                continue;
            }
            if best.map_or(true, |current| {
                slots[index].current_weight > slots[current].current_weight
            }) {
                best = Some(index);
            }
        }

        let best = best.ok_or(Error::NoHealthyBackends)?;
        slots[best].current_weight -= total;
        Ok(slots[best].backend.clone())
    }
}

impl Default for SwrrBalancer {
    fn default() -> Self {
        Self::new()
    }
}
