use std::{ptr, sync::Arc};

use anyhow::Result;
use bytes::BytesMut;
use codec::{Header, MESSAGE_SIZE, Message, Opcode};
use memory::{CACHE_LINE, GlobalPtr, fence};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use super::MAX_PAYLOAD;
use crate::{Inner, statistics::Stats};

/// Serve one accepted connection: read a request, dispatch it, reply on the
/// same socket, until the peer goes away.
///
/// This task is the only owner of the accepted socket. Requests arriving
/// here and responses to our own outgoing requests travel on different
/// connections, so nothing read in this loop can ever be confused with a
/// pending response.
pub(crate) async fn serve(inner: Arc<Inner>, mut stream: TcpStream, peer: u16) {
    let mut head = [0u8; MESSAGE_SIZE];
    let mut payload = Vec::new();
    let mut reply = BytesMut::with_capacity(MESSAGE_SIZE);

    loop {
        // EOF here is the normal end of a connection.
        if stream.read_exact(&mut head).await.is_err() {
            break;
        }

        let msg = match Message::decode(&head) {
            Ok(msg) => msg,
            Err(err) => {
                log::warn!("undecodable request: peer={}, error={:?}", peer, err);
                break;
            }
        };

        let len = msg.header.len as usize;
        if len > MAX_PAYLOAD {
            log::warn!("oversized request payload: peer={}, len={}", peer, len);
            break;
        }

        payload.clear();
        payload.resize(len, 0);
        if len > 0 && stream.read_exact(&mut payload).await.is_err() {
            break;
        }

        inner
            .statistics
            .report(Some(peer), &[Stats::ReceivedBytes(MESSAGE_SIZE + len)]);

        if let Err(err) = dispatch(&inner, &mut stream, &mut reply, peer, &msg, &payload).await {
            log::warn!(
                "request dispatch failed: peer={}, opcode={:?}, error={:?}",
                peer,
                msg.header.opcode,
                err,
            );

            break;
        }
    }

    log::info!("peer disconnected: peer={}", peer);
}

async fn dispatch(
    inner: &Arc<Inner>,
    stream: &mut TcpStream,
    reply: &mut BytesMut,
    peer: u16,
    msg: &Message,
    payload: &[u8],
) -> Result<()> {
    let me = inner.transport.node_id();

    // GET/PUT/atomics whose pointer does not translate here are dropped
    // without a reply; the initiator owns the resulting stall.
    let translatable = msg.ptr.node == me;

    match msg.header.opcode {
        Opcode::Get => {
            let size = msg.size as usize;
            if !translatable || size > MAX_PAYLOAD {
                log::warn!(
                    "get dropped: ptr={:?}, size={}, request_id={}",
                    msg.ptr,
                    size,
                    msg.header.request_id,
                );

                return Ok(());
            }

            let mut data = vec![0u8; size];
            unsafe {
                ptr::copy_nonoverlapping(
                    inner.region.translate(msg.ptr.offset) as *const u8,
                    data.as_mut_ptr(),
                    size,
                );
            }

            let response = answer(Opcode::GetResp, msg, me, size as u32);
            respond(inner, stream, reply, peer, &response, Some(&data)).await
        }
        Opcode::Put => {
            if !translatable {
                log::warn!(
                    "put dropped: ptr={:?}, size={}, request_id={}",
                    msg.ptr,
                    payload.len(),
                    msg.header.request_id,
                );

                return Ok(());
            }

            let addr = inner.region.translate(msg.ptr.offset);
            unsafe {
                ptr::copy_nonoverlapping(payload.as_ptr(), addr, payload.len());
            }

            // Make the store visible to every other mapper of this region
            // before the initiator sees the acknowledgment.
            fence::flush_range(addr, payload.len());

            let response = answer(Opcode::PutResp, msg, me, 0);
            respond(inner, stream, reply, peer, &response, None).await
        }
        Opcode::AtomicFaa => {
            if !translatable {
                log::warn!("faa dropped: ptr={:?}", msg.ptr);
                return Ok(());
            }

            let old = unsafe {
                fence::fetch_add_u64(inner.region.translate(msg.ptr.offset) as *mut u64, msg.value)
            };

            let mut response = answer(Opcode::AtomicResp, msg, me, 0);
            response.value = old;
            respond(inner, stream, reply, peer, &response, None).await
        }
        Opcode::AtomicCas => {
            if !translatable {
                log::warn!("cas dropped: ptr={:?}", msg.ptr);
                return Ok(());
            }

            // The size slot of a CAS request carries the desired value.
            let observed = unsafe {
                fence::compare_exchange_u64(
                    inner.region.translate(msg.ptr.offset) as *mut u64,
                    msg.value,
                    msg.size,
                )
            };

            let mut response = answer(Opcode::AtomicResp, msg, me, 0);
            response.value = observed;
            respond(inner, stream, reply, peer, &response, None).await
        }
        Opcode::Alloc => {
            let ptr = match inner.heap.allocate(msg.size as usize, CACHE_LINE) {
                Some(offset) => GlobalPtr::new(me, offset),
                None => GlobalPtr::null(),
            };

            let mut response = answer(Opcode::AllocResp, msg, me, 0);
            response.ptr = ptr;
            respond(inner, stream, reply, peer, &response, None).await
        }
        Opcode::Free => {
            if translatable {
                inner.heap.release(msg.ptr.offset);
            } else {
                log::warn!("free dropped: ptr={:?}", msg.ptr);
            }

            Ok(())
        }
        Opcode::Barrier => {
            inner.barrier.arrive(msg.header.src);

            let response = answer(Opcode::BarrierResp, msg, me, 0);
            respond(inner, stream, reply, peer, &response, None).await
        }
        Opcode::BarrierResp => {
            inner.barrier.release(msg.header.src);
            Ok(())
        }
        opcode => {
            log::warn!(
                "unexpected message on accepted socket: peer={}, opcode={:?}",
                peer,
                opcode,
            );

            Ok(())
        }
    }
}

/// Response skeleton: echo the pointer and operand slots, flip the routing,
/// keep the request id for log correlation.
fn answer(opcode: Opcode, request: &Message, me: u16, len: u32) -> Message {
    Message {
        header: Header {
            opcode,
            len,
            src: me,
            dst: request.header.src,
            request_id: request.header.request_id,
        },
        ptr: request.ptr,
        size: request.size,
        value: request.value,
    }
}

async fn respond(
    inner: &Arc<Inner>,
    stream: &mut TcpStream,
    reply: &mut BytesMut,
    peer: u16,
    response: &Message,
    payload: Option<&[u8]>,
) -> Result<()> {
    response.encode(reply);
    stream.write_all(reply).await?;

    if let Some(bytes) = payload {
        stream.write_all(bytes).await?;
    }

    let sent = MESSAGE_SIZE + payload.map_or(0, <[u8]>::len);
    inner
        .statistics
        .report(Some(peer), &[Stats::SendBytes(sent)]);

    Ok(())
}
