//! Reports built from the bucket index and the type aggregator. Each one is a
//! plain snapshot: building it is the only part that looks at tracker state.
//! `Display` gives the console layout and `Serialize` gives the same data
//! for tooling.

pub mod leak_log;

use std::fmt;

use serde::Serialize;

use crate::{
    alloc::{
        header::AllocKind,
        meta::{AddressRecord, Bucket, UNKNOWN},
        tracing::TrackerState,
        types::TypeEntry,
    },
    error::TrackError,
    serialize::serde_addr,
    util::num::percent,
};

/// One live (or leaked) allocation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct RecordView {
    #[serde(serialize_with = "serde_addr::serialize")]
    pub address: usize,
    pub file: &'static str,
    pub line: u32,
    pub type_label: &'static str,
}

impl From<&AddressRecord> for RecordView {
    fn from(record: &AddressRecord) -> Self {
        Self {
            address: record.address(),
            file: record.site().file,
            line: record.site().line,
            type_label: record.type_label().unwrap_or(UNKNOWN),
        }
    }
}

fn record_views(bucket: &Bucket) -> Vec<RecordView> {
    bucket
        .records_newest_first()
        .iter()
        .map(|&record| RecordView::from(record))
        .collect()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LiveBucket {
    pub size: usize,
    pub count: usize,
    /// Empty unless the report was asked for detail
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub records: Vec<RecordView>,
}

/// The live buckets of one kind, most recently created bucket first
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LiveSection {
    pub kind: AllocKind,
    pub buckets: Vec<LiveBucket>,
    pub total: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LiveReport {
    #[serde(skip)]
    count_first: bool,
    pub sections: [LiveSection; 2],
    pub total: usize,
}

impl LiveReport {
    pub(crate) fn collect(state: Option<&TrackerState>, count_first: bool, with_detail: bool) -> Self {
        let sections = AllocKind::ALL.map(|kind| {
            let buckets: Vec<LiveBucket> = match state {
                Some(state) => state
                    .index(kind)
                    .buckets_newest_first()
                    .iter()
                    .filter(|bucket| bucket.live_count() > 0)
                    .map(|bucket| LiveBucket {
                        size: bucket.size(),
                        count: bucket.live_count(),
                        records: if with_detail {
                            record_views(bucket)
                        } else {
                            Vec::new()
                        },
                    })
                    .collect(),
                None => Vec::new(),
            };
            LiveSection {
                kind,
                total: buckets.iter().map(|bucket| bucket.count).sum(),
                buckets,
            }
        });
        Self {
            count_first,
            total: sections.iter().map(|section| section.total).sum(),
            sections,
        }
    }

    pub fn section(&self, kind: AllocKind) -> &LiveSection {
        &self.sections[kind.index()]
    }

    pub fn to_json(&self) -> Result<String, TrackError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl fmt::Display for LiveReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, section) in self.sections.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            let title = match section.kind {
                AllocKind::Single => "Non-array",
                AllocKind::Bulk => "Array",
            };
            writeln!(f, "<<{title} allocations>>")?;
            for bucket in &section.buckets {
                if self.count_first {
                    write!(f, "\t{}\tallocation(s) of size: {}", bucket.count, bucket.size)?;
                } else {
                    write!(f, "\tSize: {}\t# of allocations: {}", bucket.size, bucket.count)?;
                }
                for record in &bucket.records {
                    write!(
                        f,
                        "\n\tAddress: {:#x}  File: {}  Line: {}",
                        record.address, record.file, record.line
                    )?;
                }
                writeln!(f)?;
            }
        }
        writeln!(
            f,
            "\nTotal allocations: {} ({} non-array, {} array)",
            self.total,
            self.section(AllocKind::Single).total,
            self.section(AllocKind::Bulk).total
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct TypeUsageRow {
    pub label: &'static str,
    pub blocks: usize,
    pub block_percent: f64,
    pub bytes: usize,
    pub byte_percent: f64,
}

/// Outstanding usage per type, by descending bytes. Types with equal bytes
/// appear in the order they were first attributed.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TypeUsageTable {
    pub rows: Vec<TypeUsageRow>,
    pub current_bytes: usize,
    pub current_blocks: usize,
}

impl TypeUsageTable {
    /// `ranked` must already be in report order
    pub(crate) fn new(ranked: Vec<TypeEntry>, current_bytes: usize, current_blocks: usize) -> Self {
        let rows = ranked
            .into_iter()
            .map(|entry| TypeUsageRow {
                label: entry.label,
                blocks: entry.blocks,
                block_percent: percent(entry.blocks, current_blocks),
                bytes: entry.bytes,
                byte_percent: percent(entry.bytes, current_bytes),
            })
            .collect();
        Self {
            rows,
            current_bytes,
            current_blocks,
        }
    }

    pub fn to_json(&self) -> Result<String, TrackError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl fmt::Display for TypeUsageTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<32}{:<12}{:<8}{:<12}{:<5}", "Object Type", "Blocks", "%", "Memory", "%")?;
        write!(f, "\n{:=<68}", "")?;
        for row in &self.rows {
            write!(
                f,
                "\n{:.<32}{:.<12}{:.<8.1}{:.<12}{:<5.1}",
                row.label, row.blocks, row.block_percent, row.bytes, row.byte_percent
            )?;
        }
        writeln!(f)
    }
}

/// Every leaked allocation of one size and kind
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LeakGroup {
    pub count: usize,
    pub size: usize,
    pub kind: AllocKind,
    pub records: Vec<RecordView>,
}

/// What the shutdown sweep found still live
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LeakReport {
    pub groups: Vec<LeakGroup>,
    pub total_leaked_count: usize,
    pub total_leaked_bytes: usize,
}

impl LeakReport {
    /// Consume the final state. Everything still in the index is a leak, and
    /// every byte still counted as current is leaked. The index nodes are
    /// released when `state` drops at the end.
    pub(crate) fn sweep(state: Option<TrackerState>, current_bytes: usize) -> Self {
        let mut groups = Vec::new();
        if let Some(state) = &state {
            for kind in AllocKind::ALL {
                for bucket in state.index(kind).buckets_newest_first().iter() {
                    if bucket.live_count() == 0 {
                        continue;
                    }
                    groups.push(LeakGroup {
                        count: bucket.live_count(),
                        size: bucket.size(),
                        kind,
                        records: record_views(bucket),
                    });
                }
            }
        }
        Self {
            total_leaked_count: groups.iter().map(|group| group.count).sum(),
            total_leaked_bytes: current_bytes,
            groups,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.total_leaked_count == 0
    }

    pub fn kilobytes(&self) -> f64 {
        self.total_leaked_bytes as f64 / 1000.
    }

    pub fn megabytes(&self) -> f64 {
        self.total_leaked_bytes as f64 / 1_000_000.
    }

    pub fn to_json(&self) -> Result<String, TrackError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl fmt::Display for LeakReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for group in &self.groups {
            write!(
                f,
                "{} memory leak(s) detected of size {} and type {}",
                group.count, group.size, group.kind
            )?;
            for record in &group.records {
                write!(
                    f,
                    "\n\tAddress: {:#x} File: {} Line: {}",
                    record.address, record.file, record.line
                )?;
            }
            write!(f, "\n\n")?;
        }
        writeln!(
            f,
            "Total number of leaks found: {}\nTotal memory leaked: {} bytes ({} kilobytes / {} megabytes)",
            self.total_leaked_count,
            self.total_leaked_bytes,
            self.kilobytes(),
            self.megabytes()
        )
    }
}
