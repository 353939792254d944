//! Sequence-number join across independently produced message streams.
//!
//! `SequenceSynchronizer` collects messages from several named inputs under the
//! sequence number they carry. The moment one message per required identifier
//! is present, the group is removed, handed to every registered callback and
//! returned to the caller. Older groups still waiting at that point are
//! abandoned: a newer frame completing means they can no longer complete.
//!
//! The join is lossy by contract. Memory is bounded by a ceiling on tracked
//! sequence numbers; on overflow the oldest entries are evicted unseen.

use std::collections::{HashMap, VecDeque};

use anyhow::{anyhow, Result};

pub const DEFAULT_SYNC_CAPACITY: usize = 200;
pub const DEFAULT_EVICTION_BATCH: usize = 10;

/// Messages of one sequence number, keyed by input identifier.
pub type SyncGroup<M> = HashMap<String, M>;

type CompleteCallback<M> = Box<dyn FnMut(u64, &SyncGroup<M>) + Send>;

/// Counters for diagnostics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub completed: u64,
    /// Incomplete groups dropped because a newer group completed.
    pub abandoned: u64,
    /// Incomplete groups dropped by the overflow policy.
    pub evicted: u64,
}

pub struct SequenceSynchronizer<M> {
    required: usize,
    capacity: usize,
    eviction_batch: usize,
    groups: HashMap<u64, SyncGroup<M>>,
    /// Sequence numbers in first-seen order, for overflow eviction.
    order: VecDeque<u64>,
    callbacks: Vec<CompleteCallback<M>>,
    stats: SyncStats,
}

impl<M> SequenceSynchronizer<M> {
    /// Join over `required` identifiers with the default memory limits.
    pub fn new(required: usize) -> Result<Self> {
        Self::with_limits(required, DEFAULT_SYNC_CAPACITY, DEFAULT_EVICTION_BATCH)
    }

    pub fn with_limits(required: usize, capacity: usize, eviction_batch: usize) -> Result<Self> {
        if required == 0 {
            return Err(anyhow!("synchronizer needs at least one identifier"));
        }
        if capacity == 0 {
            return Err(anyhow!("synchronizer capacity must be greater than zero"));
        }
        if eviction_batch == 0 || eviction_batch > capacity {
            return Err(anyhow!(
                "eviction batch must be between 1 and the capacity ({}), got {}",
                capacity,
                eviction_batch
            ));
        }
        Ok(Self {
            required,
            capacity,
            eviction_batch,
            groups: HashMap::new(),
            order: VecDeque::new(),
            callbacks: Vec::new(),
            stats: SyncStats::default(),
        })
    }

    /// Register a consumer of completed groups. Callbacks run synchronously,
    /// in registration order, on the thread calling `add_message`; they must
    /// not block.
    pub fn on_complete<F>(&mut self, callback: F)
    where
        F: FnMut(u64, &SyncGroup<M>) + Send + 'static,
    {
        self.callbacks.push(Box::new(callback));
    }

    /// Record `message` for `identifier` under `sequence_number`.
    ///
    /// A repeated `(sequence_number, identifier)` overwrites the earlier
    /// message. Returns the group if this message completed it.
    pub fn add_message(
        &mut self,
        identifier: impl Into<String>,
        sequence_number: u64,
        message: M,
    ) -> Option<SyncGroup<M>> {
        let group = self.groups.entry(sequence_number).or_insert_with(|| {
            self.order.push_back(sequence_number);
            HashMap::new()
        });
        group.insert(identifier.into(), message);

        if group.len() >= self.required {
            let group = self.take(sequence_number)?;
            self.stats.completed += 1;
            for callback in self.callbacks.iter_mut() {
                callback(sequence_number, &group);
            }
            self.abandon_older_than(sequence_number);
            return Some(group);
        }

        if self.groups.len() > self.capacity {
            self.evict_oldest();
        }
        None
    }

    /// Number of sequence numbers currently waiting for completion.
    pub fn pending(&self) -> usize {
        self.groups.len()
    }

    pub fn is_pending(&self, sequence_number: u64) -> bool {
        self.groups.contains_key(&sequence_number)
    }

    pub fn stats(&self) -> SyncStats {
        self.stats
    }

    /// Abandon every pending group, e.g. after an input restarted its
    /// sequence numbers.
    pub fn clear(&mut self) {
        self.stats.abandoned += self.groups.len() as u64;
        self.groups.clear();
        self.order.clear();
    }

    fn take(&mut self, sequence_number: u64) -> Option<SyncGroup<M>> {
        self.order.retain(|&seq| seq != sequence_number);
        self.groups.remove(&sequence_number)
    }

    fn abandon_older_than(&mut self, sequence_number: u64) {
        let before = self.groups.len();
        self.groups.retain(|&seq, _| {
            let keep = seq >= sequence_number;
            if !keep {
                log::debug!("removing sequence number {} from memory", seq);
            }
            keep
        });
        self.order.retain(|&seq| seq >= sequence_number);
        self.stats.abandoned += (before - self.groups.len()) as u64;
    }

    fn evict_oldest(&mut self) {
        log::error!(
            "too many sequence numbers in memory ({} > {}), evicting oldest {}",
            self.groups.len(),
            self.capacity,
            self.eviction_batch
        );
        for _ in 0..self.eviction_batch {
            let Some(seq) = self.order.pop_front() else {
                break;
            };
            if self.groups.remove(&seq).is_some() {
                self.stats.evicted += 1;
            }
        }
    }
}
