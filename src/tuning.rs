use memory::Consistency;

/// Placement preference for [`crate::Runtime::alloc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affinity {
    /// Allocate on the calling node.
    Local,
    /// Allocate on some other node, rotating across peers.
    Remote,
    /// Rotate across every node, the caller included.
    Interleave,
    /// Placement hint for replicated data; allocates locally, replica
    /// management stays with the application.
    Replicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionScheme {
    Block,
    RoundRobin,
    Hash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchMode {
    Disabled,
    Sequential,
    Aggressive,
}

/// A passive bundle of workload hints.
///
/// The runtime stores the active profile and hands it back on request; it
/// never acts on the fields itself. Clients (partitioners, transfer
/// schedulers, thread pools) read whichever hints they care about.
///
/// `num_threads == 0` means "one per CPU" and is resolved by [`threads`].
///
/// [`threads`]: TuningProfile::threads
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TuningProfile {
    pub affinity: Affinity,
    pub partition_scheme: PartitionScheme,
    pub cache_line_align: bool,
    pub numa_bind: bool,
    pub batch_size: usize,
    pub transfer_size: usize,
    pub prefetch_mode: PrefetchMode,
    pub consistency: Consistency,
    pub num_threads: usize,
    pub bandwidth_priority: u8,
    pub async_transfer: bool,
}

pub const DEFAULT: TuningProfile = TuningProfile {
    affinity: Affinity::Local,
    partition_scheme: PartitionScheme::Block,
    cache_line_align: true,
    numa_bind: false,
    batch_size: 1,
    transfer_size: 4096,
    prefetch_mode: PrefetchMode::Disabled,
    consistency: Consistency::SeqCst,
    num_threads: 0,
    bandwidth_priority: 128,
    async_transfer: false,
};

/// mcf-style pointer chasing: latency bound, tiny dependent reads.
pub const MCF: TuningProfile = TuningProfile {
    affinity: Affinity::Local,
    partition_scheme: PartitionScheme::Block,
    cache_line_align: true,
    numa_bind: true,
    batch_size: 1,
    transfer_size: 64,
    prefetch_mode: PrefetchMode::Disabled,
    consistency: Consistency::Relaxed,
    num_threads: 1,
    bandwidth_priority: 32,
    async_transfer: false,
};

/// LLM inference: huge sequential weight streams, bandwidth bound.
pub const LLAMA: TuningProfile = TuningProfile {
    affinity: Affinity::Interleave,
    partition_scheme: PartitionScheme::RoundRobin,
    cache_line_align: true,
    numa_bind: false,
    batch_size: 64,
    transfer_size: 1 << 20,
    prefetch_mode: PrefetchMode::Sequential,
    consistency: Consistency::Relaxed,
    num_threads: 0,
    bandwidth_priority: 255,
    async_transfer: true,
};

/// Molecular dynamics: NUMA-pinned halo exchanges at medium granularity.
pub const GROMACS: TuningProfile = TuningProfile {
    affinity: Affinity::Local,
    partition_scheme: PartitionScheme::Block,
    cache_line_align: true,
    numa_bind: true,
    batch_size: 16,
    transfer_size: 65536,
    prefetch_mode: PrefetchMode::Sequential,
    consistency: Consistency::Release,
    num_threads: 0,
    bandwidth_priority: 192,
    async_transfer: true,
};

/// Graph analytics: irregular remote access, atomics heavy.
pub const GRAPH: TuningProfile = TuningProfile {
    affinity: Affinity::Interleave,
    partition_scheme: PartitionScheme::Hash,
    cache_line_align: true,
    numa_bind: false,
    batch_size: 8,
    transfer_size: 256,
    prefetch_mode: PrefetchMode::Disabled,
    consistency: Consistency::SeqCst,
    num_threads: 0,
    bandwidth_priority: 96,
    async_transfer: false,
};

impl Default for TuningProfile {
    fn default() -> Self {
        DEFAULT
    }
}

impl TuningProfile {
    /// Resolve the thread hint, mapping the "one per CPU" default.
    pub fn threads(&self) -> usize {
        if self.num_threads == 0 {
            num_cpus::get()
        } else {
            self.num_threads
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_resolves_threads() {
        assert_eq!(TuningProfile::default(), DEFAULT);
        assert!(DEFAULT.threads() >= 1);
        assert_eq!(MCF.threads(), 1);
    }

    #[test]
    fn named_profiles_differ_where_it_matters() {
        assert!(LLAMA.transfer_size > GRAPH.transfer_size);
        assert!(LLAMA.async_transfer);
        assert_eq!(MCF.consistency, Consistency::Relaxed);
        assert!(GROMACS.numa_bind);
    }
}
