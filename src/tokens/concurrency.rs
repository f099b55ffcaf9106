//! Per-token concurrency manager: two independent, non-blocking
//! counters per token (image, video). A capacity of -1 means unbounded and the
//! counter is not even consulted — only the per-token lock serializes images
//! in that case.

use std::collections::HashMap;
use std::sync::Mutex;

use super::JobClass;

#[derive(Default)]
struct Counters {
    image: i64,
    video: i64,
}

pub struct ConcurrencyManager {
    in_flight: Mutex<HashMap<i64, Counters>>,
}

impl ConcurrencyManager {
    pub fn new() -> Self {
        Self {
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    fn read(counters: &Counters, class: JobClass) -> i64 {
        match class {
            JobClass::Image => counters.image,
            JobClass::Video => counters.video,
        }
    }

    fn write(counters: &mut Counters, class: JobClass) -> &mut i64 {
        match class {
            JobClass::Image => &mut counters.image,
            JobClass::Video => &mut counters.video,
        }
    }

    /// Non-blocking capacity check used by selection: true if `cap` is
    /// unbounded (-1) or the current in-flight count is below it.
    pub fn has_capacity(&self, token_id: i64, class: JobClass, cap: i64) -> bool {
        if cap < 0 {
            return true;
        }
        let guard = self.in_flight.lock().unwrap();
        let current = guard.get(&token_id).map(|c| Self::read(c, class)).unwrap_or(0);
        current < cap.max(1)
    }

    /// Acquire a slot. Non-blocking: fails immediately (caller retries another
    /// token) rather than waiting.
    pub fn try_acquire(&self, token_id: i64, class: JobClass, cap: i64) -> bool {
        if cap < 0 {
            return true;
        }
        let mut guard = self.in_flight.lock().unwrap();
        let counters = guard.entry(token_id).or_default();
        let current = Self::read(counters, class);
        if current >= cap.max(1) {
            return false;
        }
        *Self::write(counters, class) += 1;
        true
    }

    /// Idempotent: releasing past zero saturates at zero rather than going negative.
    pub fn release(&self, token_id: i64, class: JobClass) {
        let mut guard = self.in_flight.lock().unwrap();
        if let Some(counters) = guard.get_mut(&token_id) {
            let slot = Self::write(counters, class);
            *slot = slot.saturating_sub(1);
        }
    }
}

impl Default for ConcurrencyManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caps_in_flight_jobs() {
        let mgr = ConcurrencyManager::new();
        assert!(mgr.try_acquire(1, JobClass::Image, 1));
        assert!(!mgr.try_acquire(1, JobClass::Image, 1));
        mgr.release(1, JobClass::Image);
        assert!(mgr.try_acquire(1, JobClass::Image, 1));
    }

    #[test]
    fn unbounded_cap_always_has_capacity() {
        let mgr = ConcurrencyManager::new();
        for _ in 0..100 {
            assert!(mgr.try_acquire(1, JobClass::Video, -1));
        }
    }

    #[test]
    fn release_is_idempotent_and_saturating() {
        let mgr = ConcurrencyManager::new();
        mgr.release(1, JobClass::Image);
        mgr.release(1, JobClass::Image);
        assert!(mgr.try_acquire(1, JobClass::Image, 1));
    }
}
