//! Deferred attribution: call site and type arrive after the allocation has
//! already been handed out (`Box::new()` reserves, then constructs).
//!
//! The most recently created record is remembered, since the value being
//! attributed is nearly always the last thing allocated. That is only a fast
//! path. Any allocation made in between (say, while evaluating the arguments
//! of the attribution call) makes it stale, and then the index is scanned.
//! Correctness never depends on the fast path hitting.

use serde::Serialize;

use crate::alloc::{
    header::AllocKind,
    meta::{AddressRecord, BucketIndex, CallSite},
    types::TypeAggregator,
};

/// The last record the index created
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct RecentRecord {
    pub address: usize,
    pub size: usize,
    pub kind: AllocKind,
}

/// How an attribution request was resolved
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Attribution {
    /// The address was the most recent allocation
    FastPath,
    /// The most recent allocation was something else; found by scanning
    Fallback,
    /// Not an address this tracker knows about. Ignored.
    NotTracked,
}

impl Attribution {
    pub const fn is_applied(self) -> bool {
        !matches!(self, Attribution::NotTracked)
    }
}

pub(crate) struct AttributionRequest {
    pub address: usize,
    pub site: CallSite,
    pub type_label: &'static str,
    pub size_hint: Option<usize>,
}

/// Attach `request` to the record of its address.
pub(crate) fn attribute(
    indices: &mut [BucketIndex; 2],
    types: &mut TypeAggregator,
    recent: &mut Option<RecentRecord>,
    request: AttributionRequest,
) -> Attribution {
    if request.address == 0 {
        return Attribution::NotTracked;
    }

    if let Some(last) = *recent {
        if last.address == request.address {
            if let Some(record) = indices[last.kind.index()]
                .bucket_mut(last.size)
                .and_then(|bucket| bucket.get_mut(last.address))
            {
                apply(types, record, last.size, &request);
                return Attribution::FastPath;
            }
        }
    }

    let Some((kind, size, record)) = find(indices, request.address, request.size_hint) else {
        return Attribution::NotTracked;
    };
    apply(types, record, size, &request);
    *recent = Some(RecentRecord {
        address: request.address,
        size,
        kind,
    });
    Attribution::Fallback
}

/// With a size hint only the bucket of that size (in either kind) is looked
/// at, otherwise every bucket of every kind.
fn find(
    indices: &mut [BucketIndex; 2],
    address: usize,
    size_hint: Option<usize>,
) -> Option<(AllocKind, usize, &mut AddressRecord)> {
    indices.iter_mut().find_map(|index| {
        let kind = index.kind();
        match size_hint {
            Some(size) => index
                .bucket_mut(size)
                .and_then(|bucket| bucket.get_mut(address))
                .map(|record| (kind, size, record)),
            None => index
                .find_anywhere(address)
                .map(|(size, record)| (kind, size, record)),
        }
    })
}

fn apply(
    types: &mut TypeAggregator,
    record: &mut AddressRecord,
    size: usize,
    request: &AttributionRequest,
) {
    // Re-attribution moves the bytes over rather than counting them twice
    if let Some(previous) = record.type_label {
        types.remove(previous, size);
    }
    record.site = request.site;
    record.type_label = Some(request.type_label);
    types.add(request.type_label, size);
}
