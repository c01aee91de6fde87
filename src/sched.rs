//! Preemption control seam.
//!
//! The scheduler itself lives outside this subsystem; what the memory code
//! needs from it is the guarantee that a layout switch, merge or unmerge
//! runs to completion before the timer can trigger another context switch.
//! [`PreemptGuard`] expresses that bracket as a scope guard: the depth
//! counter drops on every exit path, including unwinds.

use core::marker::PhantomData;

#[cfg(not(test))]
use core::sync::atomic::{AtomicUsize, Ordering};

#[cfg(not(test))]
static PREEMPT_DEPTH: AtomicUsize = AtomicUsize::new(0);

// The target machine is single-core; the hosted test harness is not. Keep
// the depth per test thread so suites stay deterministic.
#[cfg(test)]
std::thread_local! {
    static PREEMPT_DEPTH: core::cell::Cell<usize> = const { core::cell::Cell::new(0) };
}

fn depth_add(delta: isize) -> usize {
    #[cfg(not(test))]
    {
        if delta > 0 {
            PREEMPT_DEPTH.fetch_add(delta as usize, Ordering::SeqCst)
        } else {
            PREEMPT_DEPTH.fetch_sub((-delta) as usize, Ordering::SeqCst)
        }
    }
    #[cfg(test)]
    {
        PREEMPT_DEPTH.with(|depth| {
            let previous = depth.get();
            depth.set(previous.checked_add_signed(delta).expect("preemption depth underflow"));
            previous
        })
    }
}

fn depth() -> usize {
    #[cfg(not(test))]
    {
        PREEMPT_DEPTH.load(Ordering::SeqCst)
    }
    #[cfg(test)]
    {
        PREEMPT_DEPTH.with(core::cell::Cell::get)
    }
}

/// While any guard is alive the scheduler's timer path must not switch
/// tasks; it checks [`preemption_disabled`] before doing so.
pub struct PreemptGuard {
    // Single core: the guard must stay on the thread that took it.
    _not_send: PhantomData<*const ()>,
}

impl PreemptGuard {
    pub fn new() -> Self {
        depth_add(1);
        PreemptGuard {
            _not_send: PhantomData,
        }
    }
}

impl Default for PreemptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PreemptGuard {
    fn drop(&mut self) {
        let previous = depth_add(-1);
        debug_assert!(previous > 0, "preemption depth underflow");
    }
}

pub fn preemption_disabled() -> bool {
    depth() > 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guards_nest_and_release() {
        assert!(!preemption_disabled());
        {
            let _outer = PreemptGuard::new();
            assert!(preemption_disabled());
            {
                let _inner = PreemptGuard::new();
                assert!(preemption_disabled());
            }
            assert!(preemption_disabled());
        }
        assert!(!preemption_disabled());
    }

    #[test]
    fn guard_releases_on_unwind() {
        let result = std::panic::catch_unwind(|| {
            let _guard = PreemptGuard::new();
            panic!("interrupted mid-switch");
        });
        assert!(result.is_err());
        assert!(!preemption_disabled());
    }
}
