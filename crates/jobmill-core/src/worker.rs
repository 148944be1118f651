//! Bounded execution slots for job actions
//!
//! Actions run on spawned tasks so a slow or hanging job never delays the
//! dispatcher's clock; the pool only bounds how many run at once. Permits
//! travel into the worker task and free the slot on drop.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Fixed-size pool of execution slots.
pub struct WorkerPool {
    slots: Arc<Semaphore>,
    capacity: usize,
}

impl WorkerPool {
    /// Create a pool with `capacity` concurrent slots (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a free slot. The permit keeps the slot occupied until
    /// dropped by the worker task.
    pub async fn acquire(&self) -> WorkerPermit {
        // The semaphore is never closed while the pool is alive.
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .expect("worker pool semaphore closed");
        WorkerPermit { _permit: permit }
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently free.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }
}

/// Occupied execution slot; dropping it releases the slot.
pub struct WorkerPermit {
    _permit: OwnedSemaphorePermit,
}
