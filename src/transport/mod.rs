pub(crate) mod handler;

use std::{
    net::IpAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result, bail, ensure};
use bytes::BytesMut;
use codec::{MESSAGE_SIZE, Message};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::Mutex,
    time::{sleep, timeout},
};

use crate::Inner;

/// Upper bound on a single RMA payload; a handler refusing larger frames
/// protects it from allocating absurd buffers off a corrupted header.
pub(crate) const MAX_PAYLOAD: usize = 256 << 20;

const CONNECT_ATTEMPTS: u32 = 30;
const CONNECT_INTERVAL: Duration = Duration::from_secs(1);

/// Send/receive timeout on the initiated socket during bootstrap; steady
/// state uses blocking I/O.
const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(1);

/// One slot per peer. `stream` is the socket *we* initiated: it carries our
/// outgoing requests and their responses, and nothing else, which is what
/// keeps response matching a pure socket discipline. The socket accepted
/// from this peer is owned exclusively by its handler task and never
/// appears here.
pub(crate) struct Peer {
    stream: Mutex<Option<TcpStream>>,
    active: AtomicBool,
    accepted: AtomicBool,
}

impl Peer {
    fn new() -> Self {
        Self {
            stream: Mutex::new(None),
            active: AtomicBool::new(false),
            accepted: AtomicBool::new(false),
        }
    }
}

pub(crate) struct Transport {
    node_id: u16,
    pub(crate) peers: Vec<Peer>,
    /// Serializes the fire-and-forget path (FREE, barrier release) so
    /// broadcast batches do not interleave.
    send_lock: Mutex<()>,
    request_id: AtomicU64,
}

impl Transport {
    pub(crate) fn new(node_id: u16, num_nodes: usize) -> Self {
        Self {
            node_id,
            peers: (0..num_nodes).map(|_| Peer::new()).collect(),
            send_lock: Mutex::new(()),
            request_id: AtomicU64::new(0),
        }
    }

    pub(crate) fn node_id(&self) -> u16 {
        self.node_id
    }

    /// Correlation tag for log lines; never used for dispatch.
    pub(crate) fn next_request_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn is_active(&self, node: u16) -> bool {
        self.peers
            .get(node as usize)
            .map(|peer| peer.active.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// The atomic send-request-then-read-response sequence on the initiated
    /// socket, serialized per peer.
    ///
    /// `response_payload` states how many trailing bytes the response must
    /// carry; a mismatch is an I/O error. A failed exchange drops the
    /// socket: it is not re-established, and subsequent sends to that peer
    /// fail fast.
    pub(crate) async fn exchange(
        &self,
        msg: &Message,
        payload: Option<&[u8]>,
        response_payload: Option<&mut [u8]>,
    ) -> Result<Message> {
        let dst = msg.header.dst;
        let Some(peer) = self.peers.get(dst as usize) else {
            bail!("no such node: {}", dst);
        };

        let mut guard = peer.stream.lock().await;
        let Some(stream) = guard.as_mut() else {
            bail!("peer {} is not connected", dst);
        };

        let result = round_trip(stream, msg, payload, response_payload).await;
        if result.is_err() {
            *guard = None;
            peer.active.store(false, Ordering::SeqCst);
            log::warn!("peer lost: peer={}, request_id={}", dst, msg.header.request_id);
        }

        result
    }

    /// Fire-and-forget send on the initiated socket; no response is read.
    pub(crate) async fn post(&self, msg: &Message, payload: Option<&[u8]>) -> Result<()> {
        let _serial = self.send_lock.lock().await;

        let dst = msg.header.dst;
        let Some(peer) = self.peers.get(dst as usize) else {
            bail!("no such node: {}", dst);
        };

        let mut guard = peer.stream.lock().await;
        let Some(stream) = guard.as_mut() else {
            bail!("peer {} is not connected", dst);
        };

        let mut buf = BytesMut::with_capacity(MESSAGE_SIZE);
        msg.encode(&mut buf);

        let result: Result<()> = async {
            stream.write_all(&buf).await?;
            if let Some(bytes) = payload {
                stream.write_all(bytes).await?;
            }

            Ok(())
        }
        .await;

        if result.is_err() {
            *guard = None;
            peer.active.store(false, Ordering::SeqCst);
            log::warn!("peer lost: peer={}, request_id={}", dst, msg.header.request_id);
        }

        result
    }

    /// Drop every initiated socket; peers observe the close and their
    /// handler tasks exit.
    pub(crate) async fn shutdown(&self) {
        for peer in &self.peers {
            *peer.stream.lock().await = None;
            peer.active.store(false, Ordering::SeqCst);
        }
    }
}

async fn round_trip(
    stream: &mut TcpStream,
    msg: &Message,
    payload: Option<&[u8]>,
    response_payload: Option<&mut [u8]>,
) -> Result<Message> {
    let mut buf = BytesMut::with_capacity(MESSAGE_SIZE);
    msg.encode(&mut buf);

    stream.write_all(&buf).await?;
    if let Some(bytes) = payload {
        stream.write_all(bytes).await?;
    }

    // Wait-all read of the full response on the same socket.
    let mut head = [0u8; MESSAGE_SIZE];
    stream.read_exact(&mut head).await?;
    let response = Message::decode(&head)?;

    let len = response.header.len as usize;
    match response_payload {
        Some(out) => {
            ensure!(
                len == out.len(),
                "response payload of {} bytes, expected {}",
                len,
                out.len()
            );
            stream.read_exact(out).await?;
        }
        None => ensure!(len == 0, "unexpected {} byte response payload", len),
    }

    log::trace!(
        "rma exchange: opcode={:?}, peer={}, request_id={}, response={:?}",
        msg.header.opcode,
        msg.header.dst,
        msg.header.request_id,
        response.header.opcode,
    );

    Ok(response)
}

/// Bind the listener, start the accept loop, then initiate a connection to
/// every other node concurrently. Fails when the port cannot be bound or,
/// on a multi-node cluster, when not a single peer became reachable.
pub(crate) async fn bootstrap(inner: &Arc<Inner>) -> Result<()> {
    let local = inner.config.local();

    let listener = TcpListener::bind(("0.0.0.0", local.port))
        .await
        .with_context(|| format!("failed to bind listen socket on port {}", local.port))?;

    log::info!("listening: node={}, port={}", local.id, local.port);

    *inner.acceptor.lock() = Some(tokio::spawn(accept_loop(inner.clone(), listener)));

    let mut attempts = Vec::new();
    for node in &inner.config.nodes {
        if node.id != local.id {
            attempts.push(tokio::spawn(connect(inner.clone(), node.clone())));
        }
    }

    let mut connected = 0usize;
    for attempt in attempts {
        if attempt.await.unwrap_or(false) {
            connected += 1;
        }
    }

    if inner.config.num_nodes() > 1 && connected == 0 {
        bail!("bootstrap failed: no peers reachable");
    }

    Ok(())
}

/// Dial one peer with the bounded retry loop, then identify ourselves with
/// the 4-byte node id so the acceptor knows whose handler to become.
async fn connect(inner: Arc<Inner>, node: crate::config::Node) -> bool {
    let id = (inner.transport.node_id as u32).to_ne_bytes();

    for attempt in 1..=CONNECT_ATTEMPTS {
        if let Ok(Ok(mut stream)) = timeout(
            BOOTSTRAP_TIMEOUT,
            TcpStream::connect((node.host.as_str(), node.port)),
        )
        .await
        {
            let _ = stream.set_nodelay(true);

            if let Ok(Ok(())) = timeout(BOOTSTRAP_TIMEOUT, stream.write_all(&id)).await {
                let peer = &inner.transport.peers[node.id as usize];
                *peer.stream.lock().await = Some(stream);
                peer.active.store(true, Ordering::SeqCst);

                log::info!(
                    "peer connected: peer={}, addr={}:{}, attempt={}",
                    node.id,
                    node.host,
                    node.port,
                    attempt,
                );

                return true;
            }
        }

        log::trace!("peer connect retry: peer={}, attempt={}", node.id, attempt);
        sleep(CONNECT_INTERVAL).await;
    }

    log::warn!(
        "peer unreachable: peer={}, attempts={}",
        node.id,
        CONNECT_ATTEMPTS
    );

    false
}

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener) {
    loop {
        let (mut stream, addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                log::warn!("accept error: {:?}", err);
                continue;
            }
        };

        let _ = stream.set_nodelay(true);

        // The initiator wrote its node id right after connecting; identify
        // the peer from it, with the source address and the first free slot
        // as fallbacks for short or nonsense handshakes.
        let mut id = [0u8; 4];
        let claimed = match timeout(BOOTSTRAP_TIMEOUT, stream.read_exact(&mut id)).await {
            Ok(Ok(_)) => {
                let raw = u32::from_ne_bytes(id);
                let valid = raw != inner.transport.node_id as u32
                    && (raw as usize) < inner.transport.peers.len();
                valid.then_some(raw as u16)
            }
            _ => None,
        };

        let peer = match claimed.or_else(|| fallback_slot(&inner, addr.ip())) {
            Some(peer) => peer,
            None => {
                log::warn!("no slot for accepted connection: addr={:?}", addr);
                continue;
            }
        };

        if claimed.is_none() {
            log::warn!("peer id handshake failed: matched={}, addr={:?}", peer, addr);
        }

        inner.transport.peers[peer as usize]
            .accepted
            .store(true, Ordering::SeqCst);

        log::info!("peer accepted: peer={}, addr={:?}", peer, addr);

        let task = tokio::spawn(handler::serve(inner.clone(), stream, peer));
        inner.handlers.lock().push(task);
    }
}

fn fallback_slot(inner: &Inner, ip: IpAddr) -> Option<u16> {
    let me = inner.transport.node_id;

    inner
        .config
        .nodes
        .iter()
        .find(|node| node.id != me && node.host.parse::<IpAddr>().ok() == Some(ip))
        .or_else(|| {
            inner.config.nodes.iter().find(|node| {
                node.id != me
                    && !inner.transport.peers[node.id as usize]
                        .accepted
                        .load(Ordering::SeqCst)
            })
        })
        .map(|node| node.id)
}
