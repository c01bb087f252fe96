//! Grace-period reclamation
//!
//! Programs receive interior pointers into map storage
//! (`Map::lookup_kern`); entry removal must therefore defer reclamation
//! until every execution that could have observed the pointer has
//! finished. Executions pin an epoch guard for their whole run, and the
//! map backends hand reclamation closures to [`defer_free`].
//!
//! Backed by `crossbeam-epoch`. Deferred closures own every resource they
//! reclaim into (the hashtable's closures hold the block arena's `Arc`),
//! so collection may run arbitrarily late without dangling.

pub use crossbeam_epoch::Guard;

/// Enter an epoch critical section. Dropping the guard exits it.
#[inline]
pub fn pin() -> Guard {
    crossbeam_epoch::pin()
}

/// Schedule `f` to run once every guard pinned at or before this call has
/// been dropped.
pub fn defer_free<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    let guard = pin();
    guard.defer(f);
    guard.flush();
}

/// Advisory synchronization: push this thread's deferred work toward the
/// global queue and nudge collection forward. Reclamation safety never
/// depends on calling this.
pub fn synchronize() {
    for _ in 0..4 {
        pin().flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_deferred_work_eventually_runs() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        defer_free(move || flag.store(true, Ordering::Release));
        // No guard is held; repeated pinning advances the epoch until the
        // closure is collected.
        for _ in 0..256 {
            if ran.load(Ordering::Acquire) {
                return;
            }
            synchronize();
        }
        panic!("deferred closure never ran");
    }

    #[test]
    fn test_deferred_work_waits_for_pinned_guard() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let guard = pin();
        defer_free(move || flag.store(true, Ordering::Release));
        synchronize();
        assert!(!ran.load(Ordering::Acquire));
        drop(guard);
    }
}
