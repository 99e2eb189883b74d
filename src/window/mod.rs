//! Window store for aggregate and join stages.
//!
//! A [`Window`] is a set of [`WindowPartition`]s sharing one
//! [`EvictionPolicy`]. Each partition is an ordered buffer of the
//! most recent elements for one key, oldest first. Partitions are
//! created lazily the first time an element arrives for their key.
//! A time-bounded partition that loses its last element is dropped.
//!
//! An unpartitioned window is a window whose [`Partitioner`] always
//! returns the same constant key, so it has at most one partition.
//!
//! Every inserted element is stamped with a window-wide sequence
//! number so the contents of several partitions can be merged back
//! into arrival order, e.g. for whole-window joins.
//!
//! Windows are not synchronized. The owning stage serializes every
//! access together with logic invocation.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::hash::Hash;

use chrono::DateTime;
use chrono::Utc;
use prometheus::IntGauge;
use serde::Deserialize;
use serde::Serialize;

use crate::config::EvictionPolicy;
use crate::errors::StageError;
use crate::errors::StageResult;
use crate::mapping::Mapping;
use crate::mapping::Tuple;

pub mod clock;
pub mod partitioner;

pub use clock::Clock;
pub use clock::SystemClock;
pub use clock::TestingClock;
pub use partitioner::KeyFn;
pub use partitioner::Partitioner;

#[derive(Debug, Clone)]
struct WindowEntry<T> {
    seq: u64,
    at: DateTime<Utc>,
    value: T,
}

/// The retained elements of one key.
#[derive(Debug, Clone)]
pub struct WindowPartition<T> {
    entries: VecDeque<WindowEntry<T>>,
    /// Insertions since the partition was created.
    inserted: u64,
}

impl<T> WindowPartition<T> {
    fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            inserted: 0,
        }
    }

    fn push(&mut self, seq: u64, at: DateTime<Utc>, value: T) {
        self.entries.push_back(WindowEntry { seq, at, value });
        self.inserted += 1;
    }

    /// Evict oldest elements until the bound holds again.
    fn evict(&mut self, bound: &Bound, now: DateTime<Utc>) -> usize {
        let mut evicted = 0;
        loop {
            let over = match (bound, self.entries.front()) {
                (_, None) => false,
                (Bound::Count(max), Some(_)) => self.entries.len() > *max,
                (Bound::Age(max_age), Some(oldest)) => now - oldest.at >= *max_age,
            };
            if !over {
                break;
            }
            self.entries.pop_front();
            evicted += 1;
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over the contents, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter().map(|entry| &entry.value)
    }

    fn first_seq(&self) -> u64 {
        self.entries.front().map_or(u64::MAX, |entry| entry.seq)
    }
}

impl<T: Clone> WindowPartition<T> {
    /// A copy of the contents, oldest first.
    ///
    /// Trigger callbacks always get a copy so later evictions can't
    /// change what they see.
    pub fn contents(&self) -> Vec<T> {
        self.iter().cloned().collect()
    }
}

#[derive(Debug, Clone, Copy)]
enum Bound {
    Count(usize),
    Age(chrono::Duration),
}

/// What happened when an element was inserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Insertion<K> {
    pub key: K,
    /// The partition did not exist before this element.
    pub created: bool,
    /// Elements evicted from the partition by this insertion.
    pub evicted: usize,
    /// Insertions into the partition since it was created, including
    /// this one.
    pub inserted: u64,
}

/// An element of a window snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedElement {
    /// How long the element had been in the window when the snapshot
    /// was taken.
    pub age_ms: i64,
    pub tuple: Tuple,
    /// Set on the newest element of each partition: insertions into
    /// the partition since it was created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inserted: Option<u64>,
}

pub struct Window<T, K> {
    eviction: EvictionPolicy,
    bound: Bound,
    partitioner: Partitioner<T, K>,
    partitions: HashMap<K, WindowPartition<T>>,
    clock: Box<dyn Clock>,
    next_seq: u64,
    partition_gauge: Option<IntGauge>,
}

impl<T, K> Window<T, K>
where
    T: Clone,
    K: Clone + Hash + Eq,
{
    pub fn new(
        eviction: EvictionPolicy,
        partitioner: Partitioner<T, K>,
        clock: Box<dyn Clock>,
    ) -> StageResult<Self> {
        let bound = match eviction {
            EvictionPolicy::Count(0) => {
                return Err(StageError::config("window count must be greater than zero"))
            }
            EvictionPolicy::Count(max) => Bound::Count(max),
            EvictionPolicy::Time(max_age) => chrono::Duration::from_std(max_age)
                .map(Bound::Age)
                .map_err(|err| {
                    StageError::config(format!("window duration {max_age:?} out of range: {err}"))
                })?,
        };
        Ok(Self {
            eviction,
            bound,
            partitioner,
            partitions: HashMap::new(),
            clock,
            next_seq: 0,
            partition_gauge: None,
        })
    }

    /// Keep a gauge set to the number of live partitions.
    pub fn with_partition_gauge(mut self, gauge: IntGauge) -> Self {
        gauge.set(self.partitions.len() as i64);
        self.partition_gauge = Some(gauge);
        self
    }

    pub fn eviction(&self) -> EvictionPolicy {
        self.eviction
    }

    pub fn partitioner(&self) -> &Partitioner<T, K> {
        &self.partitioner
    }

    pub fn is_time_bounded(&self) -> bool {
        matches!(self.bound, Bound::Age(_))
    }

    /// Insert an element into the partition of its key.
    pub fn insert(&mut self, value: T) -> StageResult<Insertion<K>> {
        let key = self.partitioner.key_for(&value)?;
        Ok(self.insert_keyed(key, value))
    }

    /// Append an element to the partition for `key`, creating it if
    /// needed, then apply the eviction policy to that partition.
    pub fn insert_keyed(&mut self, key: K, value: T) -> Insertion<K> {
        let now = self.clock.now();
        self.push(key, value, now)
    }

    fn push(&mut self, key: K, value: T, at: DateTime<Utc>) -> Insertion<K> {
        let seq = self.next_seq;
        self.next_seq += 1;

        let created = !self.partitions.contains_key(&key);
        let partition = self
            .partitions
            .entry(key.clone())
            .or_insert_with(WindowPartition::new);
        partition.push(seq, at, value);
        let evicted = partition.evict(&self.bound, self.clock.now());
        let inserted = partition.inserted;
        if created {
            self.inc_partitions();
        }
        tracing::trace!(
            "Inserted element {seq} into partition; created: {created}, evicted: {evicted}"
        );
        Insertion {
            key,
            created,
            evicted,
            inserted,
        }
    }

    /// A copy of the current contents for `key`, oldest first.
    ///
    /// Missing partitions evaluate to an empty list.
    pub fn evaluate(&mut self, key: &K) -> Vec<T> {
        let now = self.clock.now();
        let Some(partition) = self.partitions.get_mut(key) else {
            return Vec::new();
        };
        partition.evict(&self.bound, now);
        if partition.is_empty() {
            self.partitions.remove(key);
            self.dec_partitions();
            return Vec::new();
        }
        partition.contents()
    }

    /// A copy of the contents of every partition merged into
    /// insertion order.
    pub fn evaluate_all(&mut self) -> Vec<T> {
        self.expire();
        let mut entries: Vec<&WindowEntry<T>> = self
            .partitions
            .values()
            .flat_map(|partition| partition.entries.iter())
            .collect();
        entries.sort_unstable_by_key(|entry| entry.seq);
        entries.into_iter().map(|entry| entry.value.clone()).collect()
    }

    /// Evict aged elements from every partition.
    ///
    /// Returns the keys of partitions that lost elements but still
    /// have some. Partitions left empty are dropped.
    pub fn expire(&mut self) -> Vec<K> {
        if !self.is_time_bounded() {
            return Vec::new();
        }
        let now = self.clock.now();
        let mut modified = Vec::new();
        let mut emptied = Vec::new();
        for (key, partition) in self.partitions.iter_mut() {
            if partition.evict(&self.bound, now) > 0 {
                if partition.is_empty() {
                    emptied.push(key.clone());
                } else {
                    modified.push((partition.first_seq(), key.clone()));
                }
            }
        }
        for key in emptied {
            self.partitions.remove(&key);
            self.dec_partitions();
        }
        modified.sort_unstable_by_key(|(seq, _key)| *seq);
        modified.into_iter().map(|(_seq, key)| key).collect()
    }

    /// Keys of all partitions, ordered by their oldest element.
    pub fn keys(&self) -> Vec<K> {
        let mut keys: Vec<_> = self
            .partitions
            .iter()
            .map(|(key, partition)| (partition.first_seq(), key.clone()))
            .collect();
        keys.sort_unstable_by_key(|(seq, _key)| *seq);
        keys.into_iter().map(|(_seq, key)| key).collect()
    }

    pub fn partition(&self, key: &K) -> Option<&WindowPartition<T>> {
        self.partitions.get(key)
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn len(&self) -> usize {
        self.partitions.values().map(WindowPartition::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn clear(&mut self) {
        self.partitions.clear();
        if let Some(gauge) = &self.partition_gauge {
            gauge.set(0);
        }
    }

    /// Serialize the contents in insertion order with their ages.
    pub fn snapshot(&self, mapping: &dyn Mapping<T>) -> StageResult<Vec<SavedElement>> {
        let now = self.clock.now();
        let mut entries: Vec<(&WindowEntry<T>, Option<u64>)> = self
            .partitions
            .values()
            .flat_map(|partition| {
                let newest = partition.entries.len().saturating_sub(1);
                partition
                    .entries
                    .iter()
                    .enumerate()
                    .map(move |(i, entry)| (entry, (i == newest).then_some(partition.inserted)))
            })
            .collect();
        entries.sort_unstable_by_key(|(entry, _)| entry.seq);
        entries
            .into_iter()
            .map(|(entry, inserted)| {
                Ok(SavedElement {
                    age_ms: (now - entry.at).num_milliseconds(),
                    tuple: mapping.to_tuple(&entry.value)?,
                    inserted,
                })
            })
            .collect()
    }

    /// Replace the contents with a snapshot.
    ///
    /// Elements keep the age they had when the snapshot was taken and
    /// are re-partitioned with the window's key function. Partitions
    /// get back their insertion counts, so count triggers keep their
    /// phase.
    pub fn restore(&mut self, saved: Vec<SavedElement>, mapping: &dyn Mapping<T>) -> StageResult<()> {
        self.clear();
        let now = self.clock.now();
        for element in saved {
            let value = mapping
                .from_tuple(element.tuple)
                .map_err(|err| StageError::recovery(format!("error restoring window: {err}")))?;
            let key = self.partitioner.key_for(&value)?;
            let at = now - chrono::Duration::milliseconds(element.age_ms);
            let insertion = self.push(key, value, at);
            if let Some(inserted) = element.inserted {
                if let Some(partition) = self.partitions.get_mut(&insertion.key) {
                    partition.inserted = inserted;
                }
            }
        }
        Ok(())
    }

    fn inc_partitions(&self) {
        if let Some(gauge) = &self.partition_gauge {
            gauge.inc();
        }
    }

    fn dec_partitions(&self) {
        if let Some(gauge) = &self.partition_gauge {
            gauge.dec();
        }
    }
}
