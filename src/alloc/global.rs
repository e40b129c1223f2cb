//! Leak report at process exit, for a [`Tracker`] installed as the global
//! allocator.

use std::{
    fmt::Write,
    ptr,
    sync::atomic::{AtomicPtr, Ordering},
};

use crate::{alloc::tracing::Tracker, util::print::RawFd};

static AT_EXIT: AtomicPtr<Tracker> = AtomicPtr::new(ptr::null_mut());

/// Run [`Tracker::shutdown()`] on `tracker` when the process exits normally
/// and print the leak report to stdout. Only the first tracker registered is
/// reported; returns whether `tracker` is it.
pub fn report_at_exit(tracker: &'static Tracker) -> bool {
    let registered = AT_EXIT
        .compare_exchange(
            ptr::null_mut(),
            tracker as *const Tracker as *mut Tracker,
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .is_ok();
    if registered {
        // SAFETY: `sweep_at_exit` is a plain `extern "C" fn()` that never
        // unwinds
        let rc = unsafe { libc::atexit(sweep_at_exit) };
        if rc != 0 {
            AT_EXIT.store(ptr::null_mut(), Ordering::Release);
            return false;
        }
    }
    registered
}

extern "C" fn sweep_at_exit() {
    let tracker = AT_EXIT.load(Ordering::Acquire);
    // SAFETY: only ever set from a `&'static Tracker`
    let Some(tracker) = (unsafe { tracker.as_ref() }) else {
        return;
    };
    if let Some(report) = tracker.shutdown() {
        let _ = write!(RawFd::stdout(), "{report}");
    }
}
