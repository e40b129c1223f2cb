//! The allocator facade. [`Tracker`] hands out memory from the C heap with an
//! [`AllocationHeader`] in front of every block, and keeps the size bucket
//! index, the type aggregator and the counters up to date.
//!
//! All bookkeeping happens under one mutex, and everything the bookkeeping
//! itself allocates comes from [`Untracked`](super::manual::Untracked)
//! storage, so the lock is never requested twice by the same thread. Anything
//! else the tracker allocates while it is working (log lines, report rows)
//! re-enters the facade on the same thread and is served without being
//! recorded.

use std::{
    alloc::Layout,
    any,
    cell::Cell,
    mem,
    ptr::NonNull,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
};

use log::{debug, info, warn};

use crate::{
    alloc::{
        attribution::{self, Attribution, AttributionRequest, RecentRecord},
        header::{AllocKind, AllocationHeader, Origin},
        manual::{self, MIN_ALIGN},
        meta::{AddressRecord, BucketIndex, CallSite, UNKNOWN},
        types::TypeAggregator,
    },
    config::Config,
    error::{TrackError, Violation},
    heap_check::{self, HeapStatus},
    report::{leak_log::LeakLog, LeakReport, LiveReport, TypeUsageTable},
    util::{hint::cold, print::fatal},
};

/// What to do when the system allocator comes back empty-handed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Fail with [`TrackError::OutOfMemory`]
    Strict,
    /// Hand back no block at all
    Lenient,
}

thread_local! {
    static IN_TRACKER: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as inside the tracker for as long as it lives.
struct ReentryGuard {
    nested: bool,
}

impl ReentryGuard {
    fn enter() -> Self {
        // Thread-locals are gone while a thread is being torn down; treat that
        // as nested so nothing gets recorded
        let nested = IN_TRACKER.try_with(|flag| flag.replace(true)).unwrap_or(true);
        Self { nested }
    }

    const fn is_nested(&self) -> bool {
        self.nested
    }
}

impl Drop for ReentryGuard {
    fn drop(&mut self) {
        if !self.nested {
            let _ = IN_TRACKER.try_with(|flag| flag.set(false));
        }
    }
}

/// Everything behind the lock
pub(crate) struct TrackerState {
    pub(crate) indices: [BucketIndex; 2],
    pub(crate) types: TypeAggregator,
    pub(crate) recent: Option<RecentRecord>,
}

impl TrackerState {
    fn new() -> Self {
        Self {
            indices: [
                BucketIndex::new(AllocKind::Single),
                BucketIndex::new(AllocKind::Bulk),
            ],
            types: TypeAggregator::new(),
            recent: None,
        }
    }

    pub(crate) fn index(&self, kind: AllocKind) -> &BucketIndex {
        &self.indices[kind.index()]
    }
}

#[derive(Default)]
struct Counters {
    current_bytes: AtomicUsize,
    peak_bytes: AtomicUsize,
    current_blocks: AtomicUsize,
    peak_blocks: AtomicUsize,
}

/// An allocation tracking context. It is usable on its own through
/// [`Tracker::allocate()`]/[`Tracker::deallocate()`], or as the process
/// allocator (see [`tracing_alloc`](super::tracing_alloc)):
///
/// ```no_run
/// use memtrace::Tracker;
///
/// #[global_allocator]
/// static GLOBAL: Tracker = Tracker::new();
/// # fn main() {}
/// ```
///
/// State is created on the first tracked allocation and consumed by
/// [`Tracker::shutdown()`]. A tracker must outlive every block it handed out.
pub struct Tracker {
    state: Mutex<Option<TrackerState>>,
    counters: Counters,
    show_allocs: AtomicBool,
    show_deallocs: AtomicBool,
    shut_down: AtomicBool,
    leak_log: Mutex<Option<LeakLog>>,
}

impl Tracker {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(None),
            counters: Counters {
                current_bytes: AtomicUsize::new(0),
                peak_bytes: AtomicUsize::new(0),
                current_blocks: AtomicUsize::new(0),
                peak_blocks: AtomicUsize::new(0),
            },
            show_allocs: AtomicBool::new(false),
            show_deallocs: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            leak_log: Mutex::new(None),
        }
    }

    /// Apply `config`. With `dump_leaks` set, the leak log is truncated now and
    /// written once, at shutdown.
    pub fn configure(&self, config: &Config) -> Result<(), TrackError> {
        let _guard = ReentryGuard::enter();
        self.show_allocs.store(config.show_allocs, Ordering::Relaxed);
        self.show_deallocs.store(config.show_deallocs, Ordering::Relaxed);
        let log = if config.dump_leaks {
            Some(LeakLog::create(&config.leak_log)?)
        } else {
            None
        };
        *lock(&self.leak_log) = log;
        debug!("memtrace configured: {config:?}");
        Ok(())
    }

    /// Allocate `size` bytes of `kind`. `site` is where the request came from,
    /// if the caller knows.
    pub fn allocate(
        &self,
        size: usize,
        kind: AllocKind,
        policy: ErrorPolicy,
        site: Option<CallSite>,
    ) -> Result<Option<NonNull<u8>>, TrackError> {
        match Layout::from_size_align(size, MIN_ALIGN) {
            Ok(layout) => self.allocate_layout(layout, kind, policy, site),
            Err(_) => policy.fail(TrackError::OutOfMemory {
                size,
                align: MIN_ALIGN,
            }),
        }
    }

    /// [`Tracker::allocate()`] for an arbitrary [`Layout`].
    pub fn allocate_layout(
        &self,
        layout: Layout,
        kind: AllocKind,
        policy: ErrorPolicy,
        site: Option<CallSite>,
    ) -> Result<Option<NonNull<u8>>, TrackError> {
        let guard = ReentryGuard::enter();
        let Some((offset, full)) = AllocationHeader::layout_with_header(layout) else {
            return policy.fail(TrackError::OutOfMemory {
                size: layout.size(),
                align: layout.align(),
            });
        };
        let Ok(block) = manual::malloc(full) else {
            return cold(|| {
                policy.fail(TrackError::OutOfMemory {
                    size: layout.size(),
                    align: layout.align(),
                })
            });
        };

        let origin = if guard.is_nested() || self.shut_down.load(Ordering::Acquire) {
            Origin::Bypass
        } else {
            Origin::Tracked
        };
        let header = AllocationHeader::new(layout.size(), offset as u32, kind, origin);
        // SAFETY: `block` spans `offset + layout.size()` bytes and is aligned to
        // at least `layout.align()`; `offset` is a multiple of the header's
        // alignment
        let handle = unsafe { header.write_into(block) };
        if origin == Origin::Bypass {
            return Ok(Some(handle));
        }

        let site = CallSite::or_unavailable(site);
        let recorded = self.with_state(|state| {
            let Some(state) = state else {
                return false;
            };
            state.indices[kind.index()].add_record(layout.size(), handle.as_ptr() as usize, site);
            state.recent = Some(RecentRecord {
                address: handle.as_ptr() as usize,
                size: layout.size(),
                kind,
            });
            self.counters.grow(layout.size());
            true
        });
        if !recorded {
            // Lost the race against shutdown
            // SAFETY: `handle` was just produced by `write_into()`
            unsafe { AllocationHeader::set_origin(handle, Origin::Bypass) };
            return Ok(Some(handle));
        }

        if self.show_allocs.load(Ordering::Relaxed) {
            debug!(
                "allocation > size: {} kind: {} file: {} line: {}",
                layout.size(),
                kind,
                site.file,
                site.line
            );
        }
        Ok(Some(handle))
    }

    /// Release a block handed out as `kind`. Null is a no-op.
    ///
    /// A handle the index has no record of (foreign, already released, or
    /// released as the wrong kind) aborts the process.
    ///
    /// # Safety
    ///
    /// `handle` must be null or have been returned by this tracker, and must
    /// not be used afterwards.
    pub unsafe fn deallocate(&self, handle: *mut u8, kind: AllocKind) {
        let Some(handle) = NonNull::new(handle) else {
            return;
        };
        let _guard = ReentryGuard::enter();
        // SAFETY: the caller guarantees `handle` came from this tracker
        let header = unsafe { AllocationHeader::read(handle) };
        if !header.is_intact() {
            let error = TrackError::untracked(handle.as_ptr() as usize, Violation::BadHeader);
            fatal(format_args!("{error}"));
        }

        if header.origin() == Origin::Tracked {
            if let Err(error) = self.untrack(handle, &header, kind) {
                fatal(format_args!("{error}"));
            }
        }
        // SAFETY: the header is intact, so it knows where the block starts
        unsafe { manual::free(header.block_start(handle)) }
    }

    fn untrack(&self, handle: NonNull<u8>, header: &AllocationHeader, kind: AllocKind) -> Result<(), TrackError> {
        let address = handle.as_ptr() as usize;
        let size = header.raw_size();
        let removed = self.with_state(|state| -> Result<Option<AddressRecord>, TrackError> {
            let Some(state) = state else {
                // Everything recorded was swept at shutdown
                return Ok(None);
            };
            let record = state.indices[kind.index()].remove_record(size, address)?;
            if let Some(label) = record.type_label() {
                state.types.remove(label, size);
            }
            if state.recent.is_some_and(|recent| recent.address == address) {
                state.recent = None;
            }
            self.counters.shrink(size);
            Ok(Some(record))
        })?;

        if let Some(record) = removed {
            if self.show_deallocs.load(Ordering::Relaxed) {
                debug!(
                    "deallocation > size: {} kind: {} type: {} file: {} line: {}",
                    size,
                    kind,
                    record.type_label().unwrap_or(UNKNOWN),
                    record.site().file,
                    record.site().line
                );
            }
        }
        Ok(())
    }

    /// Attach a call site and type to the live allocation at `address`.
    /// `size_hint`, when known, limits the fallback scan to one bucket size.
    /// Addresses the tracker does not know about are ignored.
    pub fn attribute(
        &self,
        address: *const u8,
        site: CallSite,
        type_label: &'static str,
        size_hint: Option<usize>,
    ) -> Attribution {
        let _guard = ReentryGuard::enter();
        let request = AttributionRequest {
            address: address as usize,
            site,
            type_label,
            size_hint,
        };
        let outcome = self.with_state(|state| match state {
            Some(state) => attribution::attribute(
                &mut state.indices,
                &mut state.types,
                &mut state.recent,
                request,
            ),
            None => Attribution::NotTracked,
        });
        if outcome == Attribution::NotTracked {
            debug!("ignored attribution of {type_label} to untracked {address:p}");
        }
        outcome
    }

    /// Attribute the allocation behind a freshly built smart pointer (a
    /// `Box<T>`, say) to `T`. See [`attribute!`](crate::attribute).
    pub fn attribute_value<P>(&self, value: &P, site: CallSite) -> Attribution
    where
        P: std::ops::Deref,
    {
        let target: &P::Target = value;
        self.attribute(
            target as *const P::Target as *const u8,
            site,
            any::type_name::<P::Target>(),
            Some(mem::size_of_val(target)),
        )
    }

    /// Live allocations grouped by kind and size. `count_first` only changes
    /// how rows are printed; `with_detail` adds every address.
    pub fn live_allocations(&self, count_first: bool, with_detail: bool) -> LiveReport {
        let _guard = ReentryGuard::enter();
        self.with_state(|state| LiveReport::collect(state.as_ref(), count_first, with_detail))
    }

    /// Outstanding usage per attributed type, largest first
    pub fn type_usage(&self) -> TypeUsageTable {
        let _guard = ReentryGuard::enter();
        let (ranked, bytes, blocks) = self.with_state(|state| {
            let ranked = match state {
                Some(state) => state.types.ranked(),
                None => Vec::new(),
            };
            (ranked, self.current_bytes(), self.current_blocks())
        });
        TypeUsageTable::new(ranked, bytes, blocks)
    }

    /// Verify the index against itself and against the block headers.
    pub fn heap_check(&self) -> HeapStatus {
        let _guard = ReentryGuard::enter();
        self.with_state(|state| heap_check::check(state.as_ref(), self.current_bytes()))
    }

    /// Run the leak sweep: everything still live is a leak. The index is
    /// consumed and its nodes released; from here on blocks are served but not
    /// recorded. Only the first call sweeps, later ones return `None`.
    pub fn shutdown(&self) -> Option<LeakReport> {
        let _guard = ReentryGuard::enter();
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return None;
        }
        let state = lock(&self.state).take();
        let report = LeakReport::sweep(state, self.current_bytes());

        if report.total_leaked_count == 0 {
            info!("memtrace: no leaks found");
        } else {
            warn!(
                "memtrace: {} leak(s), {} bytes",
                report.total_leaked_count, report.total_leaked_bytes
            );
        }
        if let Some(log) = lock(&self.leak_log).as_mut() {
            if let Err(error) = log.append(&report) {
                warn!("memtrace: could not write the leak log: {error}");
            }
        }
        Some(report)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    pub fn current_bytes(&self) -> usize {
        self.counters.current_bytes.load(Ordering::Relaxed)
    }

    pub fn peak_bytes(&self) -> usize {
        self.counters.peak_bytes.load(Ordering::Relaxed)
    }

    pub fn current_blocks(&self) -> usize {
        self.counters.current_blocks.load(Ordering::Relaxed)
    }

    pub fn peak_blocks(&self) -> usize {
        self.counters.peak_blocks.load(Ordering::Relaxed)
    }

    /// Run `f` on the state under the lock, creating the state first if the
    /// tracker is still live.
    fn with_state<R>(&self, f: impl FnOnce(&mut Option<TrackerState>) -> R) -> R {
        let mut state = lock(&self.state);
        if state.is_none() && !self.shut_down.load(Ordering::Acquire) {
            *state = Some(TrackerState::new());
        }
        f(&mut state)
    }
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new()
    }
}

impl Counters {
    /// Only called with the state lock held
    fn grow(&self, size: usize) {
        let bytes = self.current_bytes.load(Ordering::Relaxed) + size;
        self.current_bytes.store(bytes, Ordering::Relaxed);
        self.peak_bytes.fetch_max(bytes, Ordering::Relaxed);
        let blocks = self.current_blocks.load(Ordering::Relaxed) + 1;
        self.current_blocks.store(blocks, Ordering::Relaxed);
        self.peak_blocks.fetch_max(blocks, Ordering::Relaxed);
    }

    /// Only called with the state lock held
    fn shrink(&self, size: usize) {
        self.current_bytes.fetch_sub(size, Ordering::Relaxed);
        self.current_blocks.fetch_sub(1, Ordering::Relaxed);
    }
}

impl ErrorPolicy {
    fn fail(self, error: TrackError) -> Result<Option<NonNull<u8>>, TrackError> {
        match self {
            ErrorPolicy::Strict => Err(error),
            ErrorPolicy::Lenient => Ok(None),
        }
    }
}

/// Nothing ever panics with one of these held, but a poisoned lock still
/// guards consistent data.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
