//! Integrity check of the tracked heap: the index against itself and the
//! counters, then every live record against the header in front of its block.

use std::{fmt, ptr::NonNull};

use serde::Serialize;

use crate::alloc::{
    header::{AllocKind, AllocationHeader, Origin},
    tracing::TrackerState,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum HeapStatus {
    Ok,
    Empty,
    /// The index disagrees with itself or with the counters
    BadStart,
    /// A live block's header does not match its record
    BadNode,
}

impl HeapStatus {
    pub const fn is_ok(self) -> bool {
        matches!(self, HeapStatus::Ok | HeapStatus::Empty)
    }
}

impl fmt::Display for HeapStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HeapStatus::Ok => "OK - heap is fine.",
            HeapStatus::Empty => "OK - heap is empty.",
            HeapStatus::BadStart => "ERROR - bad start of heap.",
            HeapStatus::BadNode => "ERROR - bad node in heap.",
        })
    }
}

/// `None` means the leak sweep has consumed the index. The counters still
/// hold the leaked totals and are not compared.
pub(crate) fn check(state: Option<&TrackerState>, current_bytes: usize) -> HeapStatus {
    let Some(state) = state else {
        return HeapStatus::Empty;
    };

    let mut live_bytes = 0;
    let mut live_blocks = 0;
    for kind in AllocKind::ALL {
        let index = state.index(kind);
        for bucket in index.buckets_newest_first().iter() {
            if !bucket.is_consistent() {
                return HeapStatus::BadStart;
            }
            live_bytes += bucket.size() * bucket.live_count();
            live_blocks += bucket.live_count();
        }
    }
    if live_bytes != current_bytes {
        return HeapStatus::BadStart;
    }
    if live_blocks == 0 {
        return HeapStatus::Empty;
    }

    for kind in AllocKind::ALL {
        for bucket in state.index(kind).buckets_newest_first().iter() {
            for record in bucket.records_newest_first().iter() {
                let Some(handle) = NonNull::new(record.address() as *mut u8) else {
                    return HeapStatus::BadNode;
                };
                // SAFETY: every record belongs to a block that is still live,
                // and every live block has a header
                let header = unsafe { AllocationHeader::read(handle) };
                let matches = header.is_intact()
                    && header.raw_size() == bucket.size()
                    && header.kind() == kind
                    && header.origin() == Origin::Tracked;
                if !matches {
                    return HeapStatus::BadNode;
                }
            }
        }
    }
    HeapStatus::Ok
}
