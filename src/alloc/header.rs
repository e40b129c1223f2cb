use std::{alloc::Layout, fmt, mem, ptr::NonNull};

use serde::Serialize;

use crate::util::assert::aligned_to;

/// Singular (one logical object) vs. bulk (an array-like block). The two
/// kinds are indexed separately and must be released as the kind they were
/// allocated as.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum AllocKind {
    Single = 0,
    Bulk = 1,
}

impl AllocKind {
    pub const ALL: [AllocKind; 2] = [AllocKind::Single, AllocKind::Bulk];

    pub const fn as_str(self) -> &'static str {
        match self {
            AllocKind::Single => "non-array",
            AllocKind::Bulk => "array",
        }
    }

    pub(crate) const fn index(self) -> usize {
        self as usize
    }

    const fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(AllocKind::Single),
            1 => Some(AllocKind::Bulk),
            _ => None,
        }
    }
}

impl fmt::Display for AllocKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a block was entered into the index, or handed out without
/// bookkeeping (re-entrant calls, or anything after shutdown).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Origin {
    Tracked = 0,
    Bypass = 1,
}

impl Origin {
    const fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Origin::Tracked),
            1 => Some(Origin::Bypass),
            _ => None,
        }
    }
}

const HEADER_MAGIC: u16 = 0xa11c;

/// Additional metadata that every allocation handed out by the tracker has.
/// It always sits immediately before the pointer returned to the caller:
///
/// ```plaintext
/// +--------------------+ <- block start (what malloc() returned)
/// | padding...         | `offset` bytes
/// | AllocationHeader   |
/// +--------------------+ <- handle
/// | requested size     | `raw_size` bytes
/// +--------------------+
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct AllocationHeader {
    /// The exact requested size of this allocation
    raw_size: usize,
    /// Distance from the start of the underlying block to the handle
    offset: u32,
    magic: u16,
    kind: u8,
    origin: u8,
}

impl AllocationHeader {
    pub const SIZE: usize = mem::size_of::<Self>();

    pub const fn new(raw_size: usize, offset: u32, kind: AllocKind, origin: Origin) -> Self {
        Self {
            raw_size,
            offset,
            magic: HEADER_MAGIC,
            kind: kind as u8,
            origin: origin as u8,
        }
    }

    /// Get the layout for the underlying block of a given allocation, as well
    /// as the offset at which the handle should be placed. `None` if the
    /// request overflows.
    pub fn layout_with_header(layout: Layout) -> Option<(usize, Layout)> {
        let offset = Self::SIZE.max(layout.align());
        u32::try_from(offset).ok()?;
        let size = layout.size().checked_add(offset)?;
        let layout = Layout::from_size_align(size, layout.align()).ok()?;
        Some((offset, layout))
    }

    /// Write this header into `block` and return the handle that follows it.
    ///
    /// # Safety
    ///
    /// `block` must be valid for writes of at least `self.offset` bytes and be
    /// aligned for `AllocationHeader` at `block + offset - SIZE`.
    pub unsafe fn write_into(self, block: NonNull<u8>) -> NonNull<u8> {
        let offset = self.offset as usize;
        debug_assert!(offset >= Self::SIZE);
        unsafe {
            let handle = block.as_ptr().add(offset);
            let header = handle.sub(Self::SIZE) as *mut Self;
            debug_assert!(aligned_to(header, mem::align_of::<Self>()));
            header.write(self);
            NonNull::new_unchecked(handle)
        }
    }

    /// Recover the header by its fixed negative offset from `handle`.
    ///
    /// # Safety
    ///
    /// The `SIZE` bytes before `handle` must be readable. That holds for any
    /// handle the tracker returned; for anything else the result is garbage,
    /// which [`AllocationHeader::is_intact()`] is there to catch.
    pub unsafe fn read(handle: NonNull<u8>) -> Self {
        unsafe { (handle.as_ptr().sub(Self::SIZE) as *const Self).read_unaligned() }
    }

    /// Overwrite only the origin of the header in front of `handle`.
    ///
    /// # Safety
    ///
    /// `handle` must have been produced by [`AllocationHeader::write_into()`]
    /// and still be live.
    pub unsafe fn set_origin(handle: NonNull<u8>, origin: Origin) {
        unsafe {
            let header = handle.as_ptr().sub(Self::SIZE) as *mut Self;
            (*header).origin = origin as u8;
        }
    }

    pub fn is_intact(&self) -> bool {
        self.magic == HEADER_MAGIC
            && AllocKind::from_u8(self.kind).is_some()
            && Origin::from_u8(self.origin).is_some()
            && self.offset as usize >= Self::SIZE
    }

    pub const fn raw_size(&self) -> usize {
        self.raw_size
    }

    /// Only meaningful for an intact header
    pub fn kind(&self) -> AllocKind {
        AllocKind::from_u8(self.kind).unwrap_or(AllocKind::Single)
    }

    /// Only meaningful for an intact header
    pub fn origin(&self) -> Origin {
        Origin::from_u8(self.origin).unwrap_or(Origin::Bypass)
    }

    /// The pointer `malloc()` originally returned for `handle`.
    ///
    /// # Safety
    ///
    /// `self` must be the intact header read from in front of `handle`.
    pub unsafe fn block_start(&self, handle: NonNull<u8>) -> *mut u8 {
        unsafe { handle.as_ptr().sub(self.offset as usize) }
    }
}
