//! Monotonic session-ID allocation.

use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

/// Largest per-second counter value before the seconds field advances.
const MAX_COUNTER: u32 = 922_337_202;
/// First counter value handed out within a second.
const MIN_COUNTER: u32 = 1;
/// Floor for the seconds field, predating any realistic clock reading.
const MIN_SECONDS: i64 = 1_000_000_000;

/// Allocator of collision-free session ids.
///
/// An id combines the allocation second and a per-second counter as
/// `counter * 10^10 + seconds`. Counter exhaustion (or the clock going
/// backward) advances the stored second instead, so ids are strictly
/// increasing over the process lifetime and never zero.
pub struct IdAllocator {
    state: Mutex<IdState>,
}

struct IdState {
    seconds: i64,
    counter: u32,
}

impl IdAllocator {
    /// Create an independent allocator.
    pub fn new() -> Self {
        IdAllocator {
            state: Mutex::new(IdState {
                seconds: MIN_SECONDS,
                counter: MIN_COUNTER,
            }),
        }
    }

    /// The process-wide allocator used for server sessions.
    pub fn global() -> &'static IdAllocator {
        static INSTANCE: OnceLock<IdAllocator> = OnceLock::new();
        INSTANCE.get_or_init(IdAllocator::new)
    }

    /// Allocate the next id.
    pub fn next(&self) -> i64 {
        let mut state = self.state.lock().unwrap();
        step(&mut state, now_seconds())
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        IdAllocator::new()
    }
}

fn step(state: &mut IdState, now: i64) -> i64 {
    if now > state.seconds {
        state.seconds = now;
        state.counter = MIN_COUNTER;
    } else if state.counter == MAX_COUNTER {
        state.seconds += 1;
        state.counter = MIN_COUNTER;
    } else {
        state.counter += 1;
    }
    i64::from(state.counter) * 10_000_000_000 + state.seconds
}

fn now_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(MIN_SECONDS)
}
