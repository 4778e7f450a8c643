use std::{ptr, sync::atomic::Ordering};

use anyhow::{Result, bail, ensure};
use codec::{Header, Message, Opcode};
use memory::{CACHE_LINE, GlobalPtr, fence};

use crate::{Runtime, statistics::Stats, tuning::Affinity};

impl Runtime {
    /// Read `dst.len()` bytes from `src`.
    ///
    /// Local pointers are a plain memcpy off the translated address; remote
    /// pointers cost one GET round trip. On any failure the destination is
    /// zero-filled before the error surfaces.
    pub async fn get(&self, dst: &mut [u8], src: GlobalPtr) -> Result<()> {
        self.ensure_open()?;
        ensure!(!src.is_null(), "get from null pointer");

        if dst.is_empty() {
            return Ok(());
        }

        if self.is_local(src) {
            unsafe {
                ptr::copy_nonoverlapping(
                    self.inner.region.translate(src.offset) as *const u8,
                    dst.as_mut_ptr(),
                    dst.len(),
                );
            }

            self.inner.statistics.report(None, &[Stats::LocalReads(1)]);
            return Ok(());
        }

        let msg = self.request(Opcode::Get, src, 0);
        let msg = Message {
            size: dst.len() as u64,
            ..msg
        };

        let received = dst.len();
        match self
            .inner
            .transport
            .exchange(&msg, None, Some(&mut dst[..]))
            .await
        {
            Ok(response) if response.header.opcode == Opcode::GetResp => {
                self.inner.statistics.report(
                    Some(src.node),
                    &[Stats::RemoteReads(1), Stats::ReceivedBytes(received)],
                );

                Ok(())
            }
            Ok(response) => {
                dst.fill(0);
                bail!("unexpected get response: {:?}", response.header.opcode);
            }
            Err(err) => {
                dst.fill(0);
                Err(err)
            }
        }
    }

    /// Write `src` to `dst`.
    ///
    /// The local branch flushes the written cache lines so other mappers of
    /// the region observe the store; the remote handler does the same
    /// before acknowledging.
    pub async fn put(&self, dst: GlobalPtr, src: &[u8]) -> Result<()> {
        self.ensure_open()?;
        ensure!(!dst.is_null(), "put to null pointer");

        if src.is_empty() {
            return Ok(());
        }

        if self.is_local(dst) {
            let addr = self.inner.region.translate(dst.offset);
            unsafe {
                ptr::copy_nonoverlapping(src.as_ptr(), addr, src.len());
            }

            fence::flush_range(addr, src.len());
            self.inner.statistics.report(None, &[Stats::LocalWrites(1)]);
            return Ok(());
        }

        let msg = self.request(Opcode::Put, dst, src.len() as u32);
        let msg = Message {
            size: src.len() as u64,
            ..msg
        };

        let response = self.inner.transport.exchange(&msg, Some(src), None).await?;
        ensure!(
            response.header.opcode == Opcode::PutResp,
            "unexpected put response: {:?}",
            response.header.opcode
        );

        self.inner.statistics.report(
            Some(dst.node),
            &[Stats::RemoteWrites(1), Stats::SendBytes(src.len())],
        );

        Ok(())
    }

    /// Atomic fetch-and-add on the u64 at `ptr`, returning the old value.
    /// The target must be 8-byte aligned; the owner node executes the
    /// hardware atomic either way.
    pub async fn faa(&self, ptr: GlobalPtr, value: u64) -> Result<u64> {
        self.ensure_open()?;
        ensure!(!ptr.is_null(), "faa on null pointer");

        let old = if self.is_local(ptr) {
            unsafe { fence::fetch_add_u64(self.inner.region.translate(ptr.offset) as *mut u64, value) }
        } else {
            let msg = self.request(Opcode::AtomicFaa, ptr, 0);
            let msg = Message { value, ..msg };

            let response = self.inner.transport.exchange(&msg, None, None).await?;
            ensure!(
                response.header.opcode == Opcode::AtomicResp,
                "unexpected faa response: {:?}",
                response.header.opcode
            );

            response.value
        };

        self.inner.statistics.report(
            (!self.is_local(ptr)).then_some(ptr.node),
            &[Stats::Atomics(1)],
        );

        Ok(old)
    }

    /// Atomic compare-and-swap on the u64 at `ptr`, returning the observed
    /// value: equal to `expected` exactly when the swap took place.
    pub async fn cas(&self, ptr: GlobalPtr, expected: u64, desired: u64) -> Result<u64> {
        self.ensure_open()?;
        ensure!(!ptr.is_null(), "cas on null pointer");

        let observed = if self.is_local(ptr) {
            unsafe {
                fence::compare_exchange_u64(
                    self.inner.region.translate(ptr.offset) as *mut u64,
                    expected,
                    desired,
                )
            }
        } else {
            // The size slot carries the desired value on the wire.
            let msg = self.request(Opcode::AtomicCas, ptr, 0);
            let msg = Message {
                size: desired,
                value: expected,
                ..msg
            };

            let response = self.inner.transport.exchange(&msg, None, None).await?;
            ensure!(
                response.header.opcode == Opcode::AtomicResp,
                "unexpected cas response: {:?}",
                response.header.opcode
            );

            response.value
        };

        self.inner.statistics.report(
            (!self.is_local(ptr)).then_some(ptr.node),
            &[Stats::Atomics(1)],
        );

        Ok(observed)
    }

    /// Allocate `size` bytes somewhere in the global space according to the
    /// placement preference. Returns the null pointer when the chosen
    /// node's heap has no fitting block.
    pub async fn alloc(&self, size: usize, affinity: Affinity) -> Result<GlobalPtr> {
        let me = self.my_node();

        let target = match affinity {
            Affinity::Local | Affinity::Replicate => me,
            Affinity::Remote => self.rotate(false).unwrap_or(me),
            Affinity::Interleave => self.rotate(true).unwrap_or(me),
        };

        self.alloc_on_node(size, target).await
    }

    /// Allocate `size` bytes on a specific node's heap.
    pub async fn alloc_on_node(&self, size: usize, node: u16) -> Result<GlobalPtr> {
        self.ensure_open()?;
        ensure!(node < self.num_nodes(), "no such node: {}", node);

        if node == self.my_node() {
            return Ok(match self.inner.heap.allocate(size, CACHE_LINE) {
                Some(offset) => GlobalPtr::new(node, offset),
                None => GlobalPtr::null(),
            });
        }

        let msg = self.request(Opcode::Alloc, GlobalPtr::null(), 0);
        let msg = Message {
            header: Header {
                dst: node,
                ..msg.header
            },
            size: size as u64,
            ..msg
        };

        let response = self.inner.transport.exchange(&msg, None, None).await?;
        ensure!(
            response.header.opcode == Opcode::AllocResp,
            "unexpected alloc response: {:?}",
            response.header.opcode
        );

        Ok(response.ptr)
    }

    /// Return an allocation to its owner's heap. Remote frees are
    /// fire-and-forget: no response is expected.
    pub async fn free(&self, ptr: GlobalPtr) -> Result<()> {
        self.ensure_open()?;

        if ptr.is_null() {
            return Ok(());
        }

        if self.is_local(ptr) {
            self.inner.heap.release(ptr.offset);
            return Ok(());
        }

        let msg = self.request(Opcode::Free, ptr, 0);
        self.inner.transport.post(&msg, None).await
    }

    fn request(&self, opcode: Opcode, ptr: GlobalPtr, len: u32) -> Message {
        Message {
            header: Header {
                opcode,
                len,
                src: self.my_node(),
                dst: ptr.node,
                request_id: self.inner.transport.next_request_id(),
            },
            ptr,
            size: 0,
            value: 0,
        }
    }

    /// Round-robin allocation target; `include_self` distinguishes
    /// interleaved from strictly remote placement. Only connected peers
    /// participate.
    fn rotate(&self, include_self: bool) -> Option<u16> {
        let me = self.my_node();
        let candidates: Vec<u16> = (0..self.num_nodes())
            .filter(|&node| {
                if node == me {
                    include_self
                } else {
                    self.inner.transport.is_active(node)
                }
            })
            .collect();

        if candidates.is_empty() {
            return None;
        }

        let turn = self.inner.alloc_cursor.fetch_add(1, Ordering::Relaxed);
        Some(candidates[turn % candidates.len()])
    }
}
