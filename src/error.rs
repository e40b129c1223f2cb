use std::io;

use thiserror::Error;

use crate::alloc::header::AllocKind;

#[derive(Debug, Error)]
pub enum TrackError {
    /// The system allocator could not satisfy the request, or the size is
    /// too large to describe once the header is added
    #[error("failed to acquire memory: {size} bytes aligned to {align}")]
    OutOfMemory { size: usize, align: usize },

    /// A handle that the index does not know about
    #[error("untracked pointer {address:#x}: {violation}")]
    UntrackedPointer {
        address: usize,
        violation: Violation,
    },

    #[error("invalid configuration: {0}")]
    Config(#[from] figment::Error),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Why a handle was rejected by the index
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum Violation {
    #[error("no {kind} bucket holds allocations of size {size}")]
    NoBucket { size: usize, kind: AllocKind },
    #[error("the {kind} bucket of size {size} has no record of it")]
    NoRecord { size: usize, kind: AllocKind },
    #[error("the header in front of it is damaged or foreign")]
    BadHeader,
}

impl TrackError {
    pub(crate) const fn untracked(address: usize, violation: Violation) -> Self {
        Self::UntrackedPointer { address, violation }
    }
}
