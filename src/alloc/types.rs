use std::cmp::Ordering;

use serde::Serialize;

use crate::alloc::{
    manual::Untracked,
    meta::{new_map, Map, UntrackedVec},
};

/// Outstanding blocks and bytes attributed to one type label
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct TypeEntry {
    pub label: &'static str,
    pub blocks: usize,
    pub bytes: usize,
}

/// Type label -> outstanding totals. Entries are kept in first-seen order and
/// stay around after their counts drop back to zero.
pub struct TypeAggregator {
    entries: UntrackedVec<TypeEntry>,
    by_label: Map<&'static str, usize>,
}

impl TypeAggregator {
    pub fn new() -> Self {
        Self {
            entries: UntrackedVec::new_in(Untracked),
            by_label: new_map(),
        }
    }

    /// Find-or-create the entry for `label` and apply the deltas to it.
    pub fn record(&mut self, label: &'static str, block_delta: isize, byte_delta: isize) {
        let index = match self.by_label.get(label) {
            Some(&index) => index,
            None => {
                self.entries.push(TypeEntry {
                    label,
                    blocks: 0,
                    bytes: 0,
                });
                let index = self.entries.len() - 1;
                self.by_label.insert(label, index);
                index
            }
        };
        let entry = &mut self.entries[index];
        entry.blocks = apply(entry.blocks, block_delta);
        entry.bytes = apply(entry.bytes, byte_delta);
    }

    pub fn add(&mut self, label: &'static str, bytes: usize) {
        self.record(label, 1, bytes as isize);
    }

    pub fn remove(&mut self, label: &'static str, bytes: usize) {
        self.record(label, -1, -(bytes as isize));
    }

    pub fn get(&self, label: &str) -> Option<&TypeEntry> {
        self.by_label.get(label).map(|&index| &self.entries[index])
    }

    /// Every entry ever seen, in first-seen order
    pub fn entries(&self) -> &[TypeEntry] {
        &self.entries
    }

    /// Entries with outstanding blocks, by descending bytes. Entries with equal
    /// bytes keep their first-seen order.
    pub fn ranked(&self) -> Vec<TypeEntry> {
        let mut ranked: Vec<TypeEntry> = self
            .entries
            .iter()
            .filter(|entry| entry.blocks > 0)
            .copied()
            .collect();
        merge_sort_by(&mut ranked, |a, b| b.bytes.cmp(&a.bytes));
        ranked
    }
}

impl Default for TypeAggregator {
    fn default() -> Self {
        Self::new()
    }
}

fn apply(value: usize, delta: isize) -> usize {
    match value.checked_add_signed(delta) {
        Some(value) => value,
        None => {
            debug_assert!(false, "type totals went negative ({value} + {delta})");
            0
        }
    }
}

/// Bottom-up merge sort. Stable: when `cmp` says two items are equal, the one
/// that came first stays first.
pub fn merge_sort_by<T, F>(items: &mut [T], mut cmp: F)
where
    T: Copy,
    F: FnMut(&T, &T) -> Ordering,
{
    let len = items.len();
    if len < 2 {
        return;
    }
    let mut scratch = items.to_vec();
    let mut width = 1;
    while width < len {
        let mut start = 0;
        while start < len {
            let mid = (start + width).min(len);
            let end = (start + 2 * width).min(len);
            merge(&items[start..mid], &items[mid..end], &mut scratch[start..end], &mut cmp);
            start = end;
        }
        items.copy_from_slice(&scratch);
        width *= 2;
    }
}

fn merge<T, F>(left: &[T], right: &[T], out: &mut [T], cmp: &mut F)
where
    T: Copy,
    F: FnMut(&T, &T) -> Ordering,
{
    let (mut i, mut j) = (0, 0);
    for slot in out.iter_mut() {
        // Ties take from the left
        let take_left = j == right.len()
            || (i < left.len() && cmp(&left[i], &right[j]) != Ordering::Greater);
        if take_left {
            *slot = left[i];
            i += 1;
        } else {
            *slot = right[j];
            j += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deltas_accumulate_per_label() {
        let mut types = TypeAggregator::new();
        types.add("Widget", 16);
        types.add("Widget", 16);
        types.add("Gadget", 8);
        types.remove("Widget", 16);

        assert_eq!(
            types.get("Widget"),
            Some(&TypeEntry {
                label: "Widget",
                blocks: 1,
                bytes: 16
            })
        );
        assert_eq!(types.get("Gadget").unwrap().blocks, 1);
        assert!(types.get("Sprocket").is_none());
    }

    #[test]
    fn drained_entries_stay_but_are_not_ranked() {
        let mut types = TypeAggregator::new();
        types.add("Widget", 16);
        types.remove("Widget", 16);

        assert_eq!(types.entries().len(), 1);
        assert!(types.ranked().is_empty());
    }

    #[test]
    fn equal_bytes_keep_insertion_order() {
        let mut types = TypeAggregator::new();
        types.record("Foo", 1, 100);
        types.record("Bar", 4, 100);
        types.record("Baz", 1, 300);

        let ranked: Vec<&str> = types.ranked().iter().map(|e| e.label).collect();
        assert_eq!(ranked, ["Baz", "Foo", "Bar"]);
        let again: Vec<&str> = types.ranked().iter().map(|e| e.label).collect();
        assert_eq!(ranked, again);
    }

    #[test]
    fn merge_sort_is_stable() {
        // (key, original position)
        let mut items: Vec<(u8, usize)> = [3u8, 1, 3, 2, 1, 3, 0, 2, 1]
            .into_iter()
            .enumerate()
            .map(|(i, k)| (k, i))
            .collect();
        merge_sort_by(&mut items, |a, b| a.0.cmp(&b.0));

        assert_eq!(
            items,
            [
                (0, 6),
                (1, 1),
                (1, 4),
                (1, 8),
                (2, 3),
                (2, 7),
                (3, 0),
                (3, 2),
                (3, 5)
            ]
        );
    }

    #[test]
    fn merge_sort_handles_tiny_inputs() {
        let mut empty: [u32; 0] = [];
        merge_sort_by(&mut empty, |a, b| a.cmp(b));
        let mut one = [7];
        merge_sort_by(&mut one, |a, b| a.cmp(b));
        assert_eq!(one, [7]);
    }
}
