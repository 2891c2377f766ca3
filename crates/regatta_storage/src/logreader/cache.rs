//! Per-shard cache of recent log entries.
//!
//! The cache holds one contiguous run of entries ordered by index,
//! capped by entry count with eviction from the low end. It remembers
//! the largest index it has ever held so non-contiguous reads are never
//! cached as if they extended the run.

use std::collections::VecDeque;

use regatta_raft::{Entry, LogRange};

pub(crate) struct EntryCache {
    entries: VecDeque<Entry>,
    largest_index: u64,
    capacity: usize,
}

impl EntryCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            largest_index: 0,
            capacity: capacity.max(1),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn largest_index(&self) -> u64 {
        self.largest_index
    }

    fn first_index(&self) -> Option<u64> {
        self.entries.front().map(|entry| entry.index)
    }

    fn last_index(&self) -> Option<u64> {
        self.entries.back().map(|entry| entry.index)
    }

    /// Store `new` in the cache. Entries extending the current run are
    /// appended; anything else replaces the run. Overflow evicts from
    /// the low end.
    pub(crate) fn put(&mut self, new: &[Entry]) {
        let Some(first) = new.first() else {
            return;
        };
        let contiguous = match self.last_index() {
            None => true,
            Some(last) => first.index == last + 1,
        };
        if !contiguous {
            self.entries.clear();
        }
        self.entries.extend(new.iter().cloned());
        self.largest_index = new[new.len() - 1].index;
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    /// Split the requested right-half-open `range` into the entries the
    /// cache can serve plus the missing sub-ranges below (`prepend`) and
    /// above (`append`) the cached run. Empty sub-ranges come back as
    /// default (zero) ranges.
    pub(crate) fn get(&self, range: LogRange) -> (Vec<Entry>, LogRange, LogRange) {
        let (Some(cache_first), Some(cache_last)) = (self.first_index(), self.last_index()) else {
            return (Vec::new(), LogRange::default(), range);
        };

        // Entirely below the cached run.
        if range.last_index <= cache_first {
            return (Vec::new(), range, LogRange::default());
        }
        // Entirely above the cached run.
        if range.first_index > cache_last {
            return (Vec::new(), LogRange::default(), range);
        }

        let overlap_first = range.first_index.max(cache_first);
        let overlap_last = range.last_index.min(cache_last + 1);
        let skip = (overlap_first - cache_first) as usize;
        let take = (overlap_last - overlap_first) as usize;
        let cached: Vec<Entry> = self
            .entries
            .iter()
            .skip(skip)
            .take(take)
            .cloned()
            .collect();

        let prepend = if range.first_index < cache_first {
            LogRange::new(range.first_index, cache_first)
        } else {
            LogRange::default()
        };
        let append = if range.last_index > cache_last + 1 {
            LogRange::new(cache_last + 1, range.last_index)
        } else {
            LogRange::default()
        };
        (cached, prepend, append)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: u64) -> Entry {
        Entry {
            index,
            term: 1,
            command: vec![0u8; 8],
        }
    }

    fn entries(range: std::ops::Range<u64>) -> Vec<Entry> {
        range.map(entry).collect()
    }

    #[test]
    fn get_on_empty_cache_is_all_append() {
        let cache = EntryCache::new(64);
        let (cached, prepend, append) = cache.get(LogRange::new(10, 20));
        assert!(cached.is_empty());
        assert!(prepend.is_empty());
        assert_eq!(append, LogRange::new(10, 20));
    }

    #[test]
    fn overlapping_tail_splits_into_cached_and_append() {
        let mut cache = EntryCache::new(256);
        cache.put(&entries(100..200));
        let (cached, prepend, append) = cache.get(LogRange::new(150, 250));
        assert_eq!(cached.first().unwrap().index, 150);
        assert_eq!(cached.last().unwrap().index, 199);
        assert!(prepend.is_empty());
        assert_eq!(append, LogRange::new(200, 250));
    }

    #[test]
    fn request_below_cache_is_all_prepend() {
        let mut cache = EntryCache::new(256);
        cache.put(&entries(100..200));
        let (cached, prepend, append) = cache.get(LogRange::new(10, 50));
        assert!(cached.is_empty());
        assert_eq!(prepend, LogRange::new(10, 50));
        assert!(append.is_empty());
    }

    #[test]
    fn request_straddling_low_end_splits_into_prepend_and_cached() {
        let mut cache = EntryCache::new(256);
        cache.put(&entries(100..200));
        let (cached, prepend, append) = cache.get(LogRange::new(50, 150));
        assert_eq!(cached.first().unwrap().index, 100);
        assert_eq!(cached.last().unwrap().index, 149);
        assert_eq!(prepend, LogRange::new(50, 100));
        assert!(append.is_empty());
    }

    #[test]
    fn fully_cached_request_has_no_missing_ranges() {
        let mut cache = EntryCache::new(256);
        cache.put(&entries(100..200));
        let (cached, prepend, append) = cache.get(LogRange::new(120, 130));
        assert_eq!(cached.len(), 10);
        assert!(prepend.is_empty());
        assert!(append.is_empty());
    }

    #[test]
    fn put_evicts_from_the_low_end() {
        let mut cache = EntryCache::new(10);
        cache.put(&entries(1..21));
        assert_eq!(cache.len(), 10);
        assert_eq!(cache.largest_index(), 20);
        let (cached, prepend, _) = cache.get(LogRange::new(1, 21));
        assert_eq!(cached.first().unwrap().index, 11);
        assert_eq!(prepend, LogRange::new(1, 11));
    }

    #[test]
    fn non_contiguous_put_replaces_the_run() {
        let mut cache = EntryCache::new(256);
        cache.put(&entries(1..10));
        cache.put(&entries(50..60));
        assert_eq!(cache.largest_index(), 59);
        let (cached, _, _) = cache.get(LogRange::new(1, 60));
        assert_eq!(cached.first().unwrap().index, 50);
    }
}
