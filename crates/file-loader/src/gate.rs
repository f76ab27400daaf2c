//! # Admission Gate
//!
//! Bounds the number of transport chains running at once. A slot is reserved
//! synchronously with [`AdmissionGate::reserve`], so queue position is fixed
//! by the caller's order rather than by when a task is first polled. When a
//! [`GatePermit`] drops, its slot passes directly to the oldest waiter.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{CacheError, Result};

struct GateState {
    active: usize,
    closed: bool,
    waiters: VecDeque<oneshot::Sender<GatePermit>>,
}

#[derive(Clone)]
pub struct AdmissionGate {
    state: Arc<Mutex<GateState>>,
    capacity: usize,
}

/// A held slot. Dropping it admits the next waiter.
pub struct GatePermit {
    state: Option<Arc<Mutex<GateState>>>,
}

/// A reserved place in the queue.
pub enum Ticket {
    Admitted(GatePermit),
    Queued(oneshot::Receiver<GatePermit>),
}

impl Ticket {
    /// Wait until this reservation holds a slot.
    pub async fn admitted(self) -> Result<GatePermit> {
        match self {
            Ticket::Admitted(permit) => Ok(permit),
            Ticket::Queued(rx) => rx.await.map_err(|_| shut_down()),
        }
    }
}

fn shut_down() -> CacheError {
    CacheError::Invocation("file loader is shut down".to_owned())
}

impl AdmissionGate {
    /// Create a gate admitting at most `capacity` holders (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Arc::new(Mutex::new(GateState {
                active: 0,
                closed: false,
                waiters: VecDeque::new(),
            })),
            capacity,
        }
    }

    /// Take a free slot now, or join the back of the queue.
    pub fn reserve(&self) -> Result<Ticket> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(shut_down());
        }
        if state.active < self.capacity {
            state.active += 1;
            return Ok(Ticket::Admitted(GatePermit {
                state: Some(Arc::clone(&self.state)),
            }));
        }
        let (tx, rx) = oneshot::channel();
        state.waiters.push_back(tx);
        Ok(Ticket::Queued(rx))
    }

    /// Reserve and wait for a slot.
    pub async fn acquire(&self) -> Result<GatePermit> {
        self.reserve()?.admitted().await
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots currently held.
    pub fn active(&self) -> usize {
        self.state.lock().active
    }

    /// Number of reservations waiting for a slot.
    pub fn queued(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Reject every queued and future reservation. Held permits stay valid.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.waiters.clear();
    }
}

impl fmt::Debug for AdmissionGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("AdmissionGate")
            .field("capacity", &self.capacity)
            .field("active", &state.active)
            .field("queued", &state.waiters.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        let Some(shared) = self.state.take() else {
            return;
        };
        let mut state = shared.lock();
        while let Some(waiter) = state.waiters.pop_front() {
            let next = GatePermit {
                state: Some(Arc::clone(&shared)),
            };
            match waiter.send(next) {
                Ok(()) => return,
                // Receiver gone: disarm the returned permit so it does not
                // re-enter this lock, and try the next waiter.
                Err(mut unsent) => {
                    unsent.state = None;
                }
            }
        }
        state.active -= 1;
    }
}

impl fmt::Debug for GatePermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatePermit")
            .field("armed", &self.state.is_some())
            .finish()
    }
}
