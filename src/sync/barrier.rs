//! Named barrier coordinator
//!
//! Each barrier key walks the cycle `Idle -> Waiting -> Released -> Idle`.
//! The last arrival of a generation releases every waiter and re-arms the key,
//! so a tag reused by a loop blocks again for a fresh set of arrivals.
//!
//! The last arrival may run a leader closure while it still holds the state
//! lock; its return value is broadcast to every waiter of that generation.
//! Backends use this to pick the next phase exactly once per barrier.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard};

use crate::error::{ForgeResult, NpuForgeError};
use crate::grid::ExecutionUnit;
use crate::sync_error;

/// Barrier identity: a tag, optionally scoped to one core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BarrierKey {
    pub tag: u32,
    pub core: Option<usize>,
}

impl BarrierKey {
    pub fn grid(tag: u32) -> Self {
        BarrierKey { tag, core: None }
    }

    pub fn core(tag: u32, core: usize) -> Self {
        BarrierKey {
            tag,
            core: Some(core),
        }
    }
}

impl fmt::Display for BarrierKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.core {
            Some(core) => write!(f, "{}@c{}", self.tag, core),
            None => write!(f, "{}", self.tag),
        }
    }
}

/// Observable state of one barrier key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierState {
    Idle,
    Waiting { arrived: usize, expected: usize },
}

#[derive(Debug)]
struct TagState {
    expected: usize,
    arrived: usize,
    generation: u64,
    broadcast: u64,
}

#[derive(Debug, Default)]
struct Inner {
    tags: HashMap<BarrierKey, TagState>,
    poisoned: Option<String>,
    releases: u64,
}

/// Rendezvous point for the units of one kernel invocation
#[derive(Debug)]
pub struct BarrierCoordinator {
    live_units: usize,
    inner: Mutex<Inner>,
    released: Condvar,
}

impl BarrierCoordinator {
    pub fn new(live_units: usize) -> Self {
        BarrierCoordinator {
            live_units,
            inner: Mutex::new(Inner::default()),
            released: Condvar::new(),
        }
    }

    pub fn live_units(&self) -> usize {
        self.live_units
    }

    /// Reject arrival counts that could never be satisfied
    pub fn validate(key: BarrierKey, expected: usize, live_units: usize) -> ForgeResult<()> {
        if expected == 0 {
            return Err(sync_error!("barrier {} expects zero arrivals", key));
        }
        if expected > live_units {
            return Err(NpuForgeError::BarrierOversubscribed {
                tag: key.tag,
                expected,
                live: live_units,
            });
        }
        Ok(())
    }

    /// Block until `expected` units reached `key` in the current generation
    pub fn wait(&self, key: BarrierKey, expected: usize) -> ForgeResult<()> {
        self.wait_with(key, expected, || 0).map(|_| ())
    }

    /// Like [`wait`](Self::wait); the releasing arrival runs `leader` and every
    /// waiter of the generation receives its result.
    pub fn wait_with<F>(&self, key: BarrierKey, expected: usize, leader: F) -> ForgeResult<u64>
    where
        F: FnOnce() -> u64,
    {
        Self::validate(key, expected, self.live_units)?;

        let mut inner = self.lock();
        if let Some(reason) = &inner.poisoned {
            return Err(NpuForgeError::BarrierPoisoned(reason.clone()));
        }

        let state = inner.tags.entry(key).or_insert(TagState {
            expected,
            arrived: 0,
            generation: 0,
            broadcast: 0,
        });

        if state.arrived == 0 {
            state.expected = expected;
        } else if state.expected != expected {
            let err = NpuForgeError::BarrierMismatch {
                tag: key.tag,
                expected: state.expected,
                actual: expected,
            };
            inner.poisoned = Some(err.to_string());
            self.released.notify_all();
            return Err(err);
        }

        state.arrived += 1;
        if state.arrived == state.expected {
            let value = leader();
            state.broadcast = value;
            state.arrived = 0;
            state.generation += 1;
            let generation = state.generation;
            inner.releases += 1;
            self.released.notify_all();
            tracing::trace!(barrier = %key, expected, generation, "barrier released");
            return Ok(value);
        }

        let generation = state.generation;
        loop {
            inner = match self.released.wait(inner) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(reason) = &inner.poisoned {
                return Err(NpuForgeError::BarrierPoisoned(reason.clone()));
            }
            match inner.tags.get(&key) {
                Some(state) if state.generation != generation => return Ok(state.broadcast),
                Some(_) => continue,
                None => {
                    return Err(NpuForgeError::InternalError(format!(
                        "barrier {} vanished while waiting",
                        key
                    )))
                }
            }
        }
    }

    /// Fail every current and future waiter; the first reason is kept
    pub fn poison(&self, reason: impl Into<String>) {
        let mut inner = self.lock();
        if inner.poisoned.is_none() {
            let reason = reason.into();
            tracing::debug!(%reason, "barrier coordinator poisoned");
            inner.poisoned = Some(reason);
        }
        self.released.notify_all();
    }

    pub fn is_poisoned(&self) -> bool {
        self.lock().poisoned.is_some()
    }

    pub fn state(&self, key: BarrierKey) -> BarrierState {
        match self.lock().tags.get(&key) {
            Some(state) if state.arrived > 0 => BarrierState::Waiting {
                arrived: state.arrived,
                expected: state.expected,
            },
            _ => BarrierState::Idle,
        }
    }

    /// Number of completed generations over all keys
    pub fn releases(&self) -> u64 {
        self.lock().releases
    }

    /// Guard that poisons the coordinator if the owning unit panics
    pub fn poison_on_panic(&self, unit: ExecutionUnit) -> PoisonOnPanic<'_> {
        PoisonOnPanic {
            coordinator: self,
            unit,
        }
    }

    // A panicking leader closure poisons the std mutex; the state itself stays
    // consistent and the poison flag tells peers to bail out.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Poisons the coordinator when dropped during a panic
pub struct PoisonOnPanic<'a> {
    coordinator: &'a BarrierCoordinator,
    unit: ExecutionUnit,
}

impl Drop for PoisonOnPanic<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.coordinator
                .poison(format!("unit {} panicked", self.unit));
        }
    }
}
