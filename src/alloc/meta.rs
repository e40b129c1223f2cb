//! The size bucket index: one bucket per distinct allocation size (per kind),
//! each holding the live count and the records of every address of that
//! size. All of it lives in [`Untracked`] storage.

use ahash::RandomState;
use hashbrown::HashMap;
use serde::Serialize;

use crate::{
    alloc::{header::AllocKind, manual::Untracked},
    error::{TrackError, Violation},
};

pub(crate) type Map<K, V> = HashMap<K, V, RandomState, Untracked>;
pub(crate) type UntrackedVec<T> = allocator_api2::vec::Vec<T, Untracked>;

/// `RandomState::new()` lazily boxes its seeds, which would go through the
/// global allocator. Fixed seeds do not.
pub(crate) fn new_map<K, V>() -> Map<K, V> {
    HashMap::with_hasher_in(
        RandomState::with_seeds(
            0x243f_6a88_85a3_08d3,
            0x1319_8a2e_0370_7344,
            0xa409_3822_299f_31d0,
            0x082e_fa98_ec4e_6c89,
        ),
        Untracked,
    )
}

/// Placeholder for a call site or type that was never supplied
pub const UNKNOWN: &str = "Unknown";

/// Where an allocation was requested from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct CallSite {
    pub file: &'static str,
    pub line: u32,
}

impl CallSite {
    /// Used when the allocation call did not say where it came from
    pub const UNAVAILABLE: CallSite = CallSite {
        file: "Filename unavailable",
        line: 0,
    };

    /// What a record holds before attribution fills it in
    pub const UNKNOWN: CallSite = CallSite {
        file: UNKNOWN,
        line: 0,
    };

    pub const fn new(file: &'static str, line: u32) -> Self {
        Self { file, line }
    }

    /// `None` and empty file names both mean "unavailable"
    pub fn or_unavailable(site: Option<CallSite>) -> Self {
        match site {
            Some(site) if !site.file.is_empty() => site,
            _ => Self::UNAVAILABLE,
        }
    }
}

/// Everything known about one live allocation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddressRecord {
    pub(crate) address: usize,
    pub(crate) site: CallSite,
    pub(crate) type_label: Option<&'static str>,
    /// Creation order, for reporting newest first
    pub(crate) seq: u64,
}

impl AddressRecord {
    pub const fn address(&self) -> usize {
        self.address
    }

    pub const fn site(&self) -> CallSite {
        self.site
    }

    pub const fn type_label(&self) -> Option<&'static str> {
        self.type_label
    }
}

pub struct Bucket {
    size: usize,
    live_count: usize,
    records: Map<usize, AddressRecord>,
    seq: u64,
}

impl Bucket {
    fn new(size: usize, seq: u64) -> Self {
        Self {
            size,
            live_count: 0,
            records: new_map(),
            seq,
        }
    }

    pub const fn size(&self) -> usize {
        self.size
    }

    pub const fn live_count(&self) -> usize {
        self.live_count
    }

    /// `live_count` agrees with the records actually linked
    pub fn is_consistent(&self) -> bool {
        self.live_count == self.records.len()
    }

    pub fn get(&self, address: usize) -> Option<&AddressRecord> {
        self.records.get(&address)
    }

    pub(crate) fn get_mut(&mut self, address: usize) -> Option<&mut AddressRecord> {
        self.records.get_mut(&address)
    }

    /// Records, most recently created first
    pub fn records_newest_first(&self) -> UntrackedVec<&AddressRecord> {
        let mut records: UntrackedVec<&AddressRecord> =
            UntrackedVec::with_capacity_in(self.records.len(), Untracked);
        records.extend(self.records.values());
        // seqs are unique, so an unstable sort is deterministic (and does not
        // need a scratch buffer from the global allocator)
        records.sort_unstable_by_key(|record| std::cmp::Reverse(record.seq));
        records
    }

    fn insert(&mut self, record: AddressRecord) {
        let previous = self.records.insert(record.address, record);
        debug_assert!(previous.is_none(), "address {:#x} recorded twice", record.address);
        if previous.is_none() {
            self.live_count += 1;
        }
    }

    fn remove(&mut self, address: usize) -> Option<AddressRecord> {
        let record = self.records.remove(&address)?;
        self.live_count -= 1;
        Some(record)
    }
}

/// All buckets of one [`AllocKind`]. Buckets are created on the first
/// allocation of a new size and are never removed, even once empty.
pub struct BucketIndex {
    kind: AllocKind,
    buckets: Map<usize, Bucket>,
    next_bucket_seq: u64,
    next_record_seq: u64,
}

impl BucketIndex {
    pub fn new(kind: AllocKind) -> Self {
        Self {
            kind,
            buckets: new_map(),
            next_bucket_seq: 0,
            next_record_seq: 0,
        }
    }

    pub const fn kind(&self) -> AllocKind {
        self.kind
    }

    pub fn find_or_create(&mut self, size: usize) -> &mut Bucket {
        let next_seq = &mut self.next_bucket_seq;
        self.buckets.entry(size).or_insert_with(|| {
            let bucket = Bucket::new(size, *next_seq);
            *next_seq += 1;
            bucket
        })
    }

    /// Record a new live allocation of `size` bytes at `address`. Its type is
    /// unknown until attribution says otherwise.
    pub fn add_record(&mut self, size: usize, address: usize, site: CallSite) -> &AddressRecord {
        let seq = self.next_record_seq;
        self.next_record_seq += 1;
        let bucket = self.find_or_create(size);
        bucket.insert(AddressRecord {
            address,
            site,
            type_label: None,
            seq,
        });
        bucket
            .records
            .get(&address)
            .expect("the record was inserted just above")
    }

    /// Unlink the record of `address` from the bucket of `size`. Failure means
    /// the handle was foreign, freed twice, or freed as the wrong kind.
    pub fn remove_record(&mut self, size: usize, address: usize) -> Result<AddressRecord, TrackError> {
        let kind = self.kind;
        let bucket = self
            .buckets
            .get_mut(&size)
            .ok_or(TrackError::untracked(address, Violation::NoBucket { size, kind }))?;
        bucket
            .remove(address)
            .ok_or(TrackError::untracked(address, Violation::NoRecord { size, kind }))
    }

    pub fn bucket(&self, size: usize) -> Option<&Bucket> {
        self.buckets.get(&size)
    }

    pub(crate) fn bucket_mut(&mut self, size: usize) -> Option<&mut Bucket> {
        self.buckets.get_mut(&size)
    }

    /// Scan every bucket for `address`, returning the bucket size with it
    pub(crate) fn find_anywhere(&mut self, address: usize) -> Option<(usize, &mut AddressRecord)> {
        self.buckets
            .values_mut()
            .find_map(|bucket| {
                let size = bucket.size;
                bucket.get_mut(address).map(|record| (size, record))
            })
    }

    /// Buckets, most recently created first (empty ones included)
    pub fn buckets_newest_first(&self) -> UntrackedVec<&Bucket> {
        let mut buckets: UntrackedVec<&Bucket> =
            UntrackedVec::with_capacity_in(self.buckets.len(), Untracked);
        buckets.extend(self.buckets.values());
        buckets.sort_unstable_by_key(|bucket| std::cmp::Reverse(bucket.seq));
        buckets
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Live blocks across all buckets
    pub fn live_blocks(&self) -> usize {
        self.buckets.values().map(Bucket::live_count).sum()
    }

    /// `sum(size * live_count)` across all buckets
    pub fn live_bytes(&self) -> usize {
        self.buckets
            .values()
            .map(|bucket| bucket.size * bucket.live_count)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HERE: CallSite = CallSite::new("meta.rs", 1);

    #[test]
    fn records_are_grouped_by_size() {
        let mut index = BucketIndex::new(AllocKind::Single);
        index.add_record(64, 0x1000, HERE);
        index.add_record(64, 0x2000, HERE);
        index.add_record(8, 0x3000, HERE);

        assert_eq!(index.bucket_count(), 2);
        assert_eq!(index.bucket(64).unwrap().live_count(), 2);
        assert_eq!(index.bucket(8).unwrap().live_count(), 1);
        assert_eq!(index.live_bytes(), 136);
        assert_eq!(index.live_blocks(), 3);
    }

    #[test]
    fn removing_keeps_the_empty_bucket() {
        let mut index = BucketIndex::new(AllocKind::Bulk);
        index.add_record(32, 0x1000, HERE);
        let record = index.remove_record(32, 0x1000).unwrap();
        assert_eq!(record.address(), 0x1000);
        assert_eq!(record.site(), HERE);

        let bucket = index.bucket(32).unwrap();
        assert_eq!(bucket.live_count(), 0);
        assert!(bucket.is_consistent());
        assert_eq!(index.bucket_count(), 1);
    }

    #[test]
    fn removing_the_unknown_is_a_violation() {
        let mut index = BucketIndex::new(AllocKind::Single);
        index.add_record(16, 0x1000, HERE);

        match index.remove_record(24, 0x1000) {
            Err(TrackError::UntrackedPointer { address, violation }) => {
                assert_eq!(address, 0x1000);
                assert_eq!(
                    violation,
                    Violation::NoBucket {
                        size: 24,
                        kind: AllocKind::Single
                    }
                );
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            index.remove_record(16, 0x2000),
            Err(TrackError::UntrackedPointer {
                violation: Violation::NoRecord { .. },
                ..
            })
        ));
        assert_eq!(index.bucket(16).unwrap().live_count(), 1);
    }

    #[test]
    fn newest_comes_first() {
        let mut index = BucketIndex::new(AllocKind::Single);
        index.add_record(8, 0x10, HERE);
        index.add_record(16, 0x20, HERE);
        index.add_record(8, 0x30, HERE);

        let sizes: Vec<usize> = index.buckets_newest_first().iter().map(|b| b.size()).collect();
        assert_eq!(sizes, [16, 8]);

        let bucket = index.bucket(8).unwrap();
        let addresses: Vec<usize> = bucket
            .records_newest_first()
            .iter()
            .map(|r| r.address())
            .collect();
        assert_eq!(addresses, [0x30, 0x10]);
    }

    #[test]
    fn records_start_without_a_type() {
        let mut index = BucketIndex::new(AllocKind::Single);
        let record = *index.add_record(8, 0x10, CallSite::UNAVAILABLE);
        assert_eq!(record.type_label(), None);
        assert_eq!(record.site().line, 0);

        let (size, found) = index.find_anywhere(0x10).unwrap();
        assert_eq!(size, 8);
        assert_eq!(found.address(), 0x10);
        assert!(index.find_anywhere(0x99).is_none());
    }

    #[test]
    fn empty_file_name_means_unavailable() {
        assert_eq!(CallSite::or_unavailable(Some(CallSite::new("", 7))), CallSite::UNAVAILABLE);
        assert_eq!(CallSite::or_unavailable(None), CallSite::UNAVAILABLE);
        assert_eq!(CallSite::or_unavailable(Some(HERE)), HERE);
    }
}
