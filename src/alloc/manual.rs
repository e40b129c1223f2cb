//! Untracked storage: memory that comes straight from the C heap and never
//! passes through [`Tracker`](super::tracing::Tracker). Every bookkeeping node
//! the tracker owns lives here, so recording an allocation can never cause
//! another one to be recorded.

use std::{alloc::Layout, mem, ptr::NonNull};

use allocator_api2::alloc::{AllocError, Allocator};

use crate::util::hint::cold;

/// The alignment `malloc()` guarantees on this platform.
pub const MIN_ALIGN: usize = if cfg!(any(
    target_arch = "x86_64",
    target_arch = "aarch64",
    target_arch = "powerpc64",
    target_arch = "s390x",
    target_arch = "riscv64",
    target_arch = "loongarch64",
)) {
    16
} else {
    8
};

/// This is just a regular allocator function, without any metadata stored.
/// `layout` must not be zero-sized.
pub fn malloc(layout: Layout) -> Result<NonNull<u8>, AllocError> {
    debug_assert!(layout.size() != 0);
    let data = if layout.align() <= MIN_ALIGN && layout.align() <= layout.size() {
        // SAFETY: plain `malloc()`, the size is non-zero
        unsafe { libc::malloc(layout.size()) as *mut u8 }
    } else {
        cold(|| {
            let mut out = std::ptr::null_mut();
            let align = layout.align().max(mem::size_of::<usize>());
            // SAFETY: `align` is a power of two and a multiple of
            // `sizeof(void *)`, as `posix_memalign()` demands
            let rc = unsafe { libc::posix_memalign(&mut out, align, layout.size()) };
            if rc == 0 {
                out as *mut u8
            } else {
                std::ptr::null_mut()
            }
        })
    };
    match NonNull::new(data) {
        Some(data) => Ok(data),
        None => cold(|| Err(AllocError)),
    }
}

/// # Safety
///
/// `data` must have come from [`malloc()`] and must not be used afterwards.
pub unsafe fn free(data: *mut u8) {
    unsafe { libc::free(data as _) }
}

/// [`Allocator`] over [`malloc()`]/[`free()`], for the tracker's own
/// collections.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Untracked;

unsafe impl Allocator for Untracked {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.size() == 0 {
            // A dangling pointer with the right alignment is a valid zero-sized
            // allocation
            let data = layout.align() as *mut u8;
            let slice = std::ptr::slice_from_raw_parts_mut(data, 0);
            // SAFETY: alignments are never zero
            return Ok(unsafe { NonNull::new_unchecked(slice) });
        }
        let data = malloc(layout)?;
        let slice = std::ptr::slice_from_raw_parts_mut(data.as_ptr(), layout.size());
        // SAFETY: `data` is non-null
        Ok(unsafe { NonNull::new_unchecked(slice) })
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() != 0 {
            // SAFETY: non-zero-sized blocks handed out by `allocate()` came
            // from `malloc()`
            unsafe { free(ptr.as_ptr()) }
        }
    }
}
