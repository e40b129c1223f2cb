//! Allocation tracing with call-site and type attribution, live usage reports
//! and a leak sweep at shutdown.
//!
//! Install a [`Tracker`] as the global allocator, attribute interesting
//! allocations with [`attribute!`], and ask the tracker for reports whenever.

#[macro_use]
mod macros;

pub mod alloc;
pub mod config;
pub mod error;
pub mod heap_check;
pub mod logging;
pub mod report;
pub mod serialize;
pub mod util;

pub use alloc::{
    attribution::Attribution,
    global::report_at_exit,
    header::AllocKind,
    meta::{CallSite, UNKNOWN},
    tracing::{ErrorPolicy, Tracker},
    types::TypeEntry,
};
pub use config::Config;
pub use error::{TrackError, Violation};
pub use heap_check::HeapStatus;
pub use report::{
    leak_log::LeakLog, LeakGroup, LeakReport, LiveBucket, LiveReport, LiveSection, RecordView,
    TypeUsageRow, TypeUsageTable,
};
