use std::collections::{HashSet, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard};

/// Counting permit pool bounding in-flight submissions to one engine.
///
/// Waiters are served strictly in arrival order: a released permit is
/// handed to the oldest waiter directly, so a late caller can never take
/// it first.
#[derive(Debug)]
pub struct ConcurrencyGate {
    name: String,
    max_permits: usize,
    state: Mutex<GateState>,
    handed_off: Condvar,
}

#[derive(Debug)]
struct GateState {
    available: usize,
    waiters: VecDeque<u64>,
    granted: HashSet<u64>,
    next_ticket: u64,
}

/// Admission held by one submission; dropping it releases the permit.
#[derive(Debug)]
pub struct Permit<'a> {
    gate: &'a ConcurrencyGate,
}

impl ConcurrencyGate {
    pub fn new(name: impl Into<String>, max_permits: usize) -> Self {
        let max_permits = max_permits.max(1);
        Self {
            name: name.into(),
            max_permits,
            state: Mutex::new(GateState {
                available: max_permits,
                waiters: VecDeque::new(),
                granted: HashSet::new(),
                next_ticket: 0,
            }),
            handed_off: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_permits(&self) -> usize {
        self.max_permits
    }

    pub fn in_flight(&self) -> usize {
        self.max_permits - self.lock().available
    }

    pub fn waiting(&self) -> usize {
        self.lock().waiters.len()
    }

    /// Blocks until a permit is handed to this caller.
    pub fn acquire(&self) -> Permit<'_> {
        let mut state = self.lock();
        if state.available > 0 && state.waiters.is_empty() {
            state.available -= 1;
            return Permit { gate: self };
        }

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.waiters.push_back(ticket);
        while !state.granted.remove(&ticket) {
            state = self
                .handed_off
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        Permit { gate: self }
    }

    pub fn try_acquire(&self) -> Option<Permit<'_>> {
        let mut state = self.lock();
        if state.available > 0 && state.waiters.is_empty() {
            state.available -= 1;
            return Some(Permit { gate: self });
        }
        None
    }

    fn release(&self) {
        let mut state = self.lock();
        match state.waiters.pop_front() {
            Some(next) => {
                state.granted.insert(next);
                self.handed_off.notify_all();
            }
            None => {
                state.available = (state.available + 1).min(self.max_permits);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Permit<'_> {
    pub fn gate_name(&self) -> &str {
        self.gate.name()
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        self.gate.release();
    }
}
