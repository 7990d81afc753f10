//! Admission Controller
//!
//! Two-stage gate in front of the heavy streaming work. A request first takes
//! one of `queue_capacity` queue slots without waiting, then waits up to
//! `admit_timeout` for one of `pool_capacity` pool slots. The returned
//! [`AdmissionTicket`] holds both slots until it is dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::config::AdmissionConfig;
use crate::errors::AdmissionRejection;

/// Connection admission service
#[derive(Debug)]
pub struct AdmissionController {
    queue: Arc<Semaphore>,
    pool: Arc<Semaphore>,
    queue_capacity: usize,
    pool_capacity: usize,
    admit_timeout: Duration,
    /// Pool slots currently held
    active: Arc<AtomicUsize>,
}

impl AdmissionController {
    pub fn new(config: &AdmissionConfig) -> Self {
        Self {
            queue: Arc::new(Semaphore::new(config.queue_capacity)),
            pool: Arc::new(Semaphore::new(config.pool_capacity)),
            queue_capacity: config.queue_capacity,
            pool_capacity: config.pool_capacity,
            admit_timeout: config.admit_timeout,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Acquire a queue slot then a pool slot.
    ///
    /// `QueueFull` is returned immediately when no queue slot is free;
    /// `Timeout` after waiting `admit_timeout` for a pool slot.
    pub async fn admit(&self) -> Result<AdmissionTicket, AdmissionRejection> {
        let queue_permit = match self.queue.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(
                    queue_capacity = self.queue_capacity,
                    active = self.active(),
                    "Admission rejected: queue full"
                );
                return Err(AdmissionRejection::QueueFull {
                    capacity: self.queue_capacity,
                });
            }
        };

        let pool_permit =
            match tokio::time::timeout(self.admit_timeout, self.pool.clone().acquire_owned()).await
            {
                Ok(Ok(permit)) => permit,
                Ok(Err(_closed)) => {
                    // The pool semaphore is never closed; treat it like a timeout
                    return Err(AdmissionRejection::Timeout {
                        waited: Duration::ZERO,
                    });
                }
                Err(_) => {
                    warn!(
                        waited_ms = self.admit_timeout.as_millis() as u64,
                        pool_capacity = self.pool_capacity,
                        "Admission rejected: no worker available in time"
                    );
                    return Err(AdmissionRejection::Timeout {
                        waited: self.admit_timeout,
                    });
                }
            };

        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(active, "Admission granted");

        Ok(AdmissionTicket {
            active: self.active.clone(),
            pool_permit: Some(pool_permit),
            queue_permit: Some(queue_permit),
        })
    }

    /// Operations currently holding a pool slot
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Requests holding a queue slot while waiting for the pool
    pub fn queued(&self) -> usize {
        let held = self.queue_capacity - self.queue.available_permits();
        held.saturating_sub(self.active())
    }

    /// Free queue slots, used by tests to check nothing leaked
    pub fn available_queue_slots(&self) -> usize {
        self.queue.available_permits()
    }

    /// Free pool slots
    pub fn available_pool_slots(&self) -> usize {
        self.pool.available_permits()
    }
}

/// Proof of admission. Decrements the active count, then releases the pool
/// slot and the queue slot, in that order, when dropped. The gauge therefore
/// never exceeds the pool capacity.
#[derive(Debug)]
pub struct AdmissionTicket {
    active: Arc<AtomicUsize>,
    pool_permit: Option<OwnedSemaphorePermit>,
    queue_permit: Option<OwnedSemaphorePermit>,
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        let remaining = self.active.fetch_sub(1, Ordering::SeqCst) - 1;
        drop(self.pool_permit.take());
        drop(self.queue_permit.take());
        debug!(active = remaining, "Admission released");
    }
}
