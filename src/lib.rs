//! ## PGAS runtime for CXL-attached memory clusters
//!
//! Exposes the aggregate byte-addressable memory of a fixed set of
//! processes as one global address space. Every node contributes exactly
//! one segment; application code works with 128-bit [`GlobalPtr`]s which
//! the runtime resolves either to a direct load/store (local) or to a
//! request/response round trip over TCP (remote). On top of that substrate:
//! heap allocation anywhere in the cluster, bulk [`get`]/[`put`], remote
//! [`faa`]/[`cas`], consistency [`fence`]s and a collective [`barrier`].
//!
//! Between every pair of nodes two TCP connections exist, one initiated by
//! each side. A node sends its own requests on the socket it initiated and
//! reads the responses from the same socket under a per-peer lock, while a
//! detached handler task serves the peer's requests on the accepted socket.
//! Keeping the two directions on separate connections is what makes
//! response matching a pure socket discipline: no request table, no
//! out-of-order replies.
//!
//! ```no_run
//! use pgas_runtime::{Affinity, Consistency, Runtime};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = Runtime::init("cluster.conf").await?;
//!
//!     // An 8-byte counter on some other node, bumped atomically from here.
//!     let counter = runtime.alloc(8, Affinity::Remote).await?;
//!     runtime.put(counter, &0u64.to_ne_bytes()).await?;
//!     runtime.fence(Consistency::SeqCst);
//!     let old = runtime.faa(counter, 1).await?;
//!     assert_eq!(old, 0);
//!
//!     runtime.barrier().await?;
//!     runtime.free(counter).await?;
//!     runtime.finalize().await;
//!     Ok(())
//! }
//! ```
//!
//! [`get`]: Runtime::get
//! [`put`]: Runtime::put
//! [`faa`]: Runtime::faa
//! [`cas`]: Runtime::cas
//! [`fence`]: Runtime::fence
//! [`barrier`]: Runtime::barrier

pub mod config;
pub mod statistics;
pub mod tuning;

mod barrier;
mod rma;
mod transport;

use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use anyhow::{Context, Result, ensure};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::{
    barrier::Rendezvous,
    config::{Config, Node},
    statistics::Statistics,
    transport::Transport,
};

pub use memory::{Consistency, GlobalPtr, heap::HeapUsage};

pub use crate::tuning::{Affinity, TuningProfile};

/// Heap bound when the config does not give one: the low GiB of the
/// segment, leaving everything above for application-reserved well-known
/// offsets.
const DEFAULT_HEAP_BOUND: usize = 1 << 30;

/// Cluster-wide view of one node's region. `base` and `size` are the
/// values the owner declared; `mapped` is true only for the local segment,
/// whose actually-mapped base backs translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub owner: u16,
    pub base: u64,
    pub size: u64,
    pub mapped: bool,
}

/// Shared state behind a [`Runtime`] handle. Handler tasks hold clones of
/// the `Arc`, which is what keeps the region mapped while any RMA against
/// it can still be in flight.
pub(crate) struct Inner {
    pub(crate) config: Config,
    pub(crate) region: memory::Region,
    pub(crate) heap: memory::Heap,
    pub(crate) heap_size: usize,
    pub(crate) transport: Transport,
    pub(crate) statistics: Statistics,
    pub(crate) barrier: Rendezvous,
    pub(crate) tuning: RwLock<TuningProfile>,
    pub(crate) alloc_cursor: AtomicUsize,
    pub(crate) closed: AtomicBool,
    pub(crate) acceptor: Mutex<Option<JoinHandle<()>>>,
    pub(crate) handlers: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to the local node's runtime context. Cheap to clone; all clones
/// share the same segment, transport and counters.
#[derive(Clone)]
pub struct Runtime {
    pub(crate) inner: Arc<Inner>,
}

impl Runtime {
    /// Initialize from a config file: acquire the local region, lay out the
    /// heap, bind the listener and bootstrap the peer mesh.
    pub async fn init<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::with_config(Config::load(path)?).await
    }

    /// Initialize from an already-parsed [`Config`].
    pub async fn with_config(config: Config) -> Result<Self> {
        let local = config.local().clone();

        let region = memory::Region::acquire(local.cxl_size as usize, config.dax_device.as_deref())
            .context("failed to acquire local region")?;

        let heap_size = config
            .heap_size
            .unwrap_or(DEFAULT_HEAP_BOUND)
            .min(region.len());
        ensure!(
            heap_size >= memory::CACHE_LINE * 2,
            "segment of {} bytes cannot hold a heap block",
            region.len()
        );
        let heap = unsafe { memory::Heap::new(region.base(), heap_size) };

        let statistics = Statistics::default();
        for node in &config.nodes {
            if node.id != local.id {
                statistics.register(node.id);
            }
        }

        let num_nodes = config.num_nodes() as usize;
        let inner = Arc::new(Inner {
            transport: Transport::new(local.id, num_nodes),
            barrier: Rendezvous::new(num_nodes),
            tuning: RwLock::new(TuningProfile::default()),
            alloc_cursor: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            acceptor: Mutex::new(None),
            handlers: Mutex::new(Vec::new()),
            region,
            heap,
            heap_size,
            statistics,
            config,
        });

        transport::bootstrap(&inner).await?;

        log::info!(
            "runtime up: node={}, nodes={}, region={}, heap={}",
            local.id,
            num_nodes,
            inner.region.len(),
            heap_size,
        );

        Ok(Self { inner })
    }

    /// Best-effort teardown: stop the listener and handler tasks and close
    /// every peer socket. Outstanding RMAs are not drained; peers observe
    /// the closed sockets and their handlers exit. The region itself stays
    /// mapped until the last clone of this handle is gone.
    pub async fn finalize(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(acceptor) = self.inner.acceptor.lock().take() {
            acceptor.abort();
        }

        for handler in self.inner.handlers.lock().drain(..) {
            handler.abort();
        }

        self.inner.transport.shutdown().await;

        let totals = self.inner.statistics.snapshot();
        log::info!(
            "runtime down: node={}, local={}, remote={}, atomics={}, barriers={}",
            self.my_node(),
            totals.local_reads + totals.local_writes,
            totals.remote_reads + totals.remote_writes,
            totals.atomics,
            totals.barriers,
        );
    }

    pub fn my_node(&self) -> u16 {
        self.inner.transport.node_id()
    }

    pub fn num_nodes(&self) -> u16 {
        self.inner.config.num_nodes()
    }

    /// Static descriptor of any node in the cluster.
    pub fn node(&self, id: u16) -> Option<&Node> {
        self.inner.config.nodes.get(id as usize)
    }

    /// Whether the initiated socket to `id` is usable right now.
    pub fn is_connected(&self, id: u16) -> bool {
        self.inner.transport.is_active(id)
    }

    pub fn segment(&self, id: u16) -> Option<Segment> {
        self.node(id).map(|node| Segment {
            owner: node.id,
            base: node.cxl_base,
            size: node.cxl_size,
            mapped: node.id == self.my_node(),
        })
    }

    pub fn statistics(&self) -> &Statistics {
        &self.inner.statistics
    }

    /// Live accounting of the local heap.
    pub fn heap_usage(&self) -> HeapUsage {
        self.inner.heap.usage()
    }

    /// Bytes at the low end of the segment managed by the allocator;
    /// offsets at or above this are application-reserved well-known
    /// offsets.
    pub fn heap_size(&self) -> usize {
        self.inner.heap_size
    }

    /// `true` when the pointer resolves inside this node's segment.
    pub fn is_local(&self, ptr: GlobalPtr) -> bool {
        ptr.node == self.my_node()
    }

    /// Raw address of a local pointer, or null when the pointer is remote.
    /// No bounds check: the caller owns staying inside the segment.
    pub fn local_ptr(&self, ptr: GlobalPtr) -> *mut u8 {
        if self.is_local(ptr) {
            self.inner.region.translate(ptr.offset)
        } else {
            std::ptr::null_mut()
        }
    }

    /// Local memory-ordering fence for the given consistency level.
    pub fn fence(&self, level: Consistency) {
        memory::fence::fence(level);
    }

    /// Write back the cache lines under a *local* range, making earlier
    /// stores visible to other mappers of the region without a PUT.
    pub fn flush(&self, ptr: GlobalPtr, len: usize) {
        if self.is_local(ptr) {
            memory::fence::flush_range(self.inner.region.translate(ptr.offset), len);
        }
    }

    /// The active tuning profile. Purely advisory state: the runtime stores
    /// it for clients to read, it never acts on the hints itself.
    pub fn tuning(&self) -> TuningProfile {
        *self.inner.tuning.read()
    }

    pub fn set_tuning(&self, profile: TuningProfile) {
        *self.inner.tuning.write() = profile;
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        ensure!(
            !self.inner.closed.load(Ordering::SeqCst),
            "runtime is finalized"
        );

        Ok(())
    }
}
