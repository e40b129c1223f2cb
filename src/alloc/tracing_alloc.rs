//! [`Tracker`] as the process allocator.
//!
//! ```no_run
//! use memtrace::Tracker;
//!
//! #[global_allocator]
//! static GLOBAL: Tracker = Tracker::new();
//!
//! fn main() {
//!     let boxed = memtrace::attribute!(GLOBAL, Box::new([0u64; 4]));
//!     drop(boxed);
//!     print!("{}", GLOBAL.type_usage());
//! }
//! ```
//!
//! `alloc()` requests are recorded as singular allocations. Only growable
//! containers ever resize, so every block `realloc()` produces is recorded as
//! bulk. `dealloc()` releases a block as whatever kind its header says it is.

use std::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
};

use crate::alloc::{
    header::{AllocKind, AllocationHeader},
    tracing::{ErrorPolicy, Tracker},
};

unsafe impl GlobalAlloc for Tracker {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match self.allocate_layout(layout, AllocKind::Single, ErrorPolicy::Lenient, None) {
            Ok(Some(handle)) => handle.as_ptr(),
            _ => ptr::null_mut(),
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        // SAFETY: identical contract
        let data = unsafe { self.alloc(layout) };
        if !data.is_null() {
            // SAFETY: `data` is valid for `layout.size()` bytes
            unsafe { ptr::write_bytes(data, 0, layout.size()) };
        }
        data
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _: Layout) {
        let Some(handle) = NonNull::new(ptr) else {
            return;
        };
        // SAFETY: the caller guarantees `ptr` came from this allocator, so a
        // header sits in front of it
        let kind = unsafe { AllocationHeader::read(handle) }.kind();
        // SAFETY: identical contract
        unsafe { self.deallocate(ptr, kind) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        // SAFETY: the caller guarantees `new_size` rounded up to `layout.align()`
        // does not overflow
        let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
        let new_ptr = match self.allocate_layout(new_layout, AllocKind::Bulk, ErrorPolicy::Lenient, None) {
            Ok(Some(handle)) => handle.as_ptr(),
            _ => return ptr::null_mut(),
        };
        // SAFETY: both blocks are live, distinct, and valid for the smaller of
        // the two sizes
        unsafe {
            ptr::copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size));
            self.dealloc(ptr, layout);
        }
        new_ptr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn realloc_produces_a_bulk_block() {
        let tracker = Tracker::new();
        let layout = Layout::from_size_align(12, 4).unwrap();
        unsafe {
            let p = tracker.alloc(layout);
            assert!(!p.is_null());
            ptr::copy_nonoverlapping(b"hello, world".as_ptr(), p, 12);

            let grown = tracker.realloc(p, layout, 48);
            assert_eq!(std::slice::from_raw_parts(grown, 12), b"hello, world");
            assert_eq!(tracker.current_bytes(), 48);
            let header = AllocationHeader::read(NonNull::new(grown).unwrap());
            assert_eq!(header.kind(), AllocKind::Bulk);

            tracker.dealloc(grown, Layout::from_size_align(48, 4).unwrap());
        }
        assert_eq!(tracker.current_blocks(), 0);
        assert_eq!(tracker.peak_blocks(), 2);
    }

    #[test]
    fn zeroed_means_zeroed() {
        let tracker = Tracker::new();
        let layout = Layout::array::<u64>(32).unwrap();
        unsafe {
            let p = tracker.alloc_zeroed(layout);
            let words = std::slice::from_raw_parts(p as *const u64, 32);
            assert!(words.iter().all(|&w| w == 0));
            tracker.dealloc(p, layout);
        }
        assert_eq!(tracker.current_bytes(), 0);
    }

    #[test]
    fn zero_sized_layouts_still_get_a_header() {
        let tracker = Tracker::new();
        let layout = Layout::from_size_align(0, 1).unwrap();
        unsafe {
            let p = tracker.alloc(layout);
            assert!(!p.is_null());
            assert_eq!(tracker.current_blocks(), 1);
            assert_eq!(tracker.current_bytes(), 0);
            tracker.dealloc(p, layout);
        }
        assert_eq!(tracker.current_blocks(), 0);
    }
}
