use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Result, ensure};
use codec::{Header, Message, Opcode};
use memory::GlobalPtr;
use tokio::sync::Notify;

use crate::{Runtime, statistics::Stats};

/// Rendezvous bookkeeping updated by the handler tasks.
///
/// Counters are cumulative per peer: a node's k-th barrier waits for every
/// counter to reach k. That makes back-to-back barriers safe without any
/// drain phase, since an early peer's k+1-th announcement can never satisfy
/// someone still waiting on generation k.
pub(crate) struct Rendezvous {
    generation: AtomicU64,
    arrivals: Vec<AtomicU64>,
    releases: Vec<AtomicU64>,
    notify: Notify,
}

impl Rendezvous {
    pub(crate) fn new(num_nodes: usize) -> Self {
        Self {
            generation: AtomicU64::new(0),
            arrivals: (0..num_nodes).map(|_| AtomicU64::new(0)).collect(),
            releases: (0..num_nodes).map(|_| AtomicU64::new(0)).collect(),
            notify: Notify::new(),
        }
    }

    /// A peer announced it entered its next barrier.
    pub(crate) fn arrive(&self, node: u16) {
        if let Some(counter) = self.arrivals.get(node as usize) {
            counter.fetch_add(1, Ordering::SeqCst);
            self.notify.notify_waiters();
        }
    }

    /// A peer finished collecting arrivals and released us.
    pub(crate) fn release(&self, node: u16) {
        if let Some(counter) = self.releases.get(node as usize) {
            counter.fetch_add(1, Ordering::SeqCst);
            self.notify.notify_waiters();
        }
    }

    async fn wait(&self, counters: &[AtomicU64], participants: &[u16], generation: u64) {
        loop {
            // Register for the wakeup before checking, so an increment
            // landing between the check and the await is not lost.
            let notified = self.notify.notified();

            if participants
                .iter()
                .all(|&peer| counters[peer as usize].load(Ordering::SeqCst) >= generation)
            {
                return;
            }

            notified.await;
        }
    }
}

impl Runtime {
    /// Collective rendezvous: when this returns, every active node has
    /// entered the same barrier generation. Two phases, both symmetric:
    /// announce the arrival to every peer (the peer's handler acks at
    /// once), wait for every peer's announcement, then broadcast a release
    /// and wait to be released. O(n²) messages, sized for n ≤ 16.
    ///
    /// One collective at a time per node; overlapping barrier calls from
    /// different tasks on the same runtime are a caller error.
    pub async fn barrier(&self) -> Result<()> {
        self.ensure_open()?;

        let inner = &self.inner;
        let me = inner.transport.node_id();
        let peers: Vec<u16> = (0..inner.config.num_nodes())
            .filter(|&node| node != me && inner.transport.is_active(node))
            .collect();

        let generation = inner.barrier.generation.fetch_add(1, Ordering::SeqCst) + 1;

        if !peers.is_empty() {
            for &peer in &peers {
                let msg = collective(Opcode::Barrier, me, peer, inner.transport.next_request_id());
                let ack = inner.transport.exchange(&msg, None, None).await?;
                ensure!(
                    ack.header.opcode == Opcode::BarrierResp,
                    "unexpected barrier ack: {:?}",
                    ack.header.opcode
                );
            }

            inner
                .barrier
                .wait(&inner.barrier.arrivals, &peers, generation)
                .await;

            for &peer in &peers {
                let msg = collective(
                    Opcode::BarrierResp,
                    me,
                    peer,
                    inner.transport.next_request_id(),
                );
                inner.transport.post(&msg, None).await?;
            }

            inner
                .barrier
                .wait(&inner.barrier.releases, &peers, generation)
                .await;
        }

        inner.statistics.report(None, &[Stats::Barriers(1)]);
        Ok(())
    }
}

fn collective(opcode: Opcode, src: u16, dst: u16, request_id: u64) -> Message {
    Message {
        header: Header {
            opcode,
            len: 0,
            src,
            dst,
            request_id,
        },
        ptr: GlobalPtr::null(),
        size: 0,
        value: 0,
    }
}
