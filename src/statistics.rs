use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use ahash::AHashMap;
use parking_lot::RwLock;

/// One observation reported into the statistics table.
#[derive(Debug, Clone, Copy)]
pub enum Stats {
    LocalReads(usize),
    LocalWrites(usize),
    RemoteReads(usize),
    RemoteWrites(usize),
    ReceivedBytes(usize),
    SendBytes(usize),
    Atomics(usize),
    Barriers(usize),
}

pub trait Number {
    fn add(&self, value: usize);
    fn get(&self) -> usize;
}

/// Counters are only ever incremented and read for reporting, so relaxed
/// ordering is enough.
#[derive(Default)]
pub struct Count(AtomicUsize);

impl Number for Count {
    fn add(&self, value: usize) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

/// One bundle of operation counters, generic so that a live atomic table
/// and a plain snapshot share the field list.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counts<T> {
    pub local_reads: T,
    pub local_writes: T,
    pub remote_reads: T,
    pub remote_writes: T,
    pub received_bytes: T,
    pub send_bytes: T,
    pub atomics: T,
    pub barriers: T,
}

impl<T: Number> Counts<T> {
    pub fn add(&self, payload: &Stats) {
        match payload {
            Stats::LocalReads(v) => self.local_reads.add(*v),
            Stats::LocalWrites(v) => self.local_writes.add(*v),
            Stats::RemoteReads(v) => self.remote_reads.add(*v),
            Stats::RemoteWrites(v) => self.remote_writes.add(*v),
            Stats::ReceivedBytes(v) => self.received_bytes.add(*v),
            Stats::SendBytes(v) => self.send_bytes.add(*v),
            Stats::Atomics(v) => self.atomics.add(*v),
            Stats::Barriers(v) => self.barriers.add(*v),
        }
    }

    fn snapshot(&self) -> Counts<usize> {
        Counts {
            local_reads: self.local_reads.get(),
            local_writes: self.local_writes.get(),
            remote_reads: self.remote_reads.get(),
            remote_writes: self.remote_writes.get(),
            received_bytes: self.received_bytes.get(),
            send_bytes: self.send_bytes.get(),
            atomics: self.atomics.get(),
            barriers: self.barriers.get(),
        }
    }
}

/// Process-wide operation counters plus a per-peer breakdown.
///
/// # Example
///
/// ```
/// use pgas_runtime::statistics::{Statistics, Stats};
///
/// let statistics = Statistics::default();
/// statistics.register(1);
///
/// statistics.report(Some(1), &[Stats::RemoteReads(1), Stats::ReceivedBytes(64)]);
///
/// assert_eq!(statistics.snapshot().remote_reads, 1);
/// assert_eq!(statistics.peer(1).unwrap().received_bytes, 64);
/// assert!(statistics.peer(9).is_none());
/// ```
#[derive(Clone, Default)]
pub struct Statistics {
    totals: Arc<Counts<Count>>,
    peers: Arc<RwLock<AHashMap<u16, Counts<Count>>>>,
}

impl Statistics {
    /// Add a peer to the breakdown table. Called once per peer at init.
    pub fn register(&self, node: u16) {
        self.peers.write().insert(node, Counts::default());
    }

    /// Fold a batch of observations into the totals and, when a peer id is
    /// given, into that peer's row.
    pub fn report(&self, peer: Option<u16>, reports: &[Stats]) {
        for item in reports {
            self.totals.add(item);
        }

        if let Some(node) = peer {
            if let Some(counts) = self.peers.read().get(&node) {
                for item in reports {
                    counts.add(item);
                }
            }
        }
    }

    pub fn snapshot(&self) -> Counts<usize> {
        self.totals.snapshot()
    }

    pub fn peer(&self, node: u16) -> Option<Counts<usize>> {
        self.peers.read().get(&node).map(|counts| counts.snapshot())
    }
}
