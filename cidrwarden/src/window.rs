//! Time- and size-bounded sliding window of request records.
//!
//! The window keeps a FIFO of timed records, a counted trie mirroring
//! exactly the multiset of addresses currently queued, and per-address
//! request statistics. Eviction happens on [`SlidingWindow::drop_old`]:
//! first by age (strictly older than `now - max_age`), then by trimming
//! down to `max_size`.
//!
//! All time handling takes explicit `now` values so callers inject the
//! clock; nothing in here reads wall time.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, TimeDelta, Utc};

use crate::trie::CountedTrie;

/// One filtered request attributed to a source address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedRecord {
    pub addr: u32,
    pub ts: DateTime<Utc>,
    /// Whether the user-agent predicate matched.
    pub ua_ok: bool,
    /// Whether the endpoint predicate matched.
    pub ep_ok: bool,
}

/// Rolling per-address request statistics.
///
/// `eps` and `uas` always hold `n` entries; `deltas` holds `n - 1`
/// inter-arrival gaps (or none while `n <= 1`).
#[derive(Debug, Clone, Default)]
pub struct AddrStats {
    pub last_ts: Option<DateTime<Utc>>,
    pub deltas: VecDeque<TimeDelta>,
    pub eps: VecDeque<bool>,
    pub uas: VecDeque<bool>,
    pub n: usize,
}

impl AddrStats {
    fn push(&mut self, record: &TimedRecord) {
        self.eps.push_back(record.ep_ok);
        self.uas.push_back(record.ua_ok);
        if let Some(last) = self.last_ts {
            if self.n > 0 {
                self.deltas.push_back(record.ts - last);
            }
        }
        self.last_ts = Some(record.ts);
        self.n += 1;
    }

    /// Drop the oldest contribution. Pops on already-empty slices are
    /// tolerated rather than trusted never to happen.
    fn pop_oldest(&mut self) {
        self.n = self.n.saturating_sub(1);
        self.eps.pop_front();
        self.uas.pop_front();
        self.deltas.pop_front();
    }
}

pub struct SlidingWindow {
    queue: VecDeque<TimedRecord>,
    trie: CountedTrie,
    stats: HashMap<u32, AddrStats>,
    max_age: TimeDelta,
    max_size: usize,
}

impl SlidingWindow {
    pub fn new(max_age: TimeDelta, max_size: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            trie: CountedTrie::new(),
            stats: HashMap::new(),
            max_age,
            max_size,
        }
    }

    /// Append records to the tail, mirroring each into the trie and the
    /// per-address stats.
    pub fn insert_new(&mut self, records: &[TimedRecord]) {
        for record in records {
            self.queue.push_back(*record);
            self.trie.insert(record.addr);
            self.stats.entry(record.addr).or_default().push(record);
        }
    }

    /// Evict by age (strict `ts < now - max_age`), then trim the queue down
    /// to `max_size` from the head.
    pub fn drop_old(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.max_age;
        while self
            .queue
            .front()
            .is_some_and(|record| record.ts < cutoff)
        {
            self.pop_front_record();
        }
        while self.queue.len() > self.max_size {
            self.pop_front_record();
        }
    }

    /// `insert_new` followed by `drop_old`, in that order.
    pub fn update(&mut self, records: &[TimedRecord], now: DateTime<Utc>) {
        self.insert_new(records);
        self.drop_old(now);
    }

    fn pop_front_record(&mut self) {
        let Some(record) = self.queue.pop_front() else {
            return;
        };
        self.trie.remove(record.addr);
        if let Entry::Occupied(mut entry) = self.stats.entry(record.addr) {
            entry.get_mut().pop_oldest();
            if entry.get().n == 0 {
                entry.remove();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn trie(&self) -> &CountedTrie {
        &self.trie
    }

    pub fn stats(&self) -> &HashMap<u32, AddrStats> {
        &self.stats
    }

    /// Distinct addresses currently represented.
    pub fn unique_addrs(&self) -> usize {
        self.stats.len()
    }
}
