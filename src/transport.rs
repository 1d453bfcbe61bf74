//! # Connection Adapter
//!
//! Owns everything between a socket and a [`Frame`]:
//!
//! - **Dialing** through a pluggable [`Dialer`] (default [`TcpDialer`])
//! - **Listening** via [`Listener`], yielding [`RawConnection`]s
//! - **Framing**: `u32` big-endian length prefix + bincode body
//! - **Address book**: bounded peer id → listen address map
//! - **Peer slots**: one async-mutex-guarded connection slot per peer, so
//!   concurrent senders to the same peer share a single dial
//!
//! ## Connection Lifecycle
//!
//! ```text
//! RawConnection ──handshake──► activate() ──► (ConnectionHandle, FrameReader)
//!   Connecting     Handshaking               Active ──close()──► Closed
//! ```
//!
//! After activation the stream is split: a writer task owns the write half
//! and drains the handle's send queue, the caller owns the read half through
//! [`FrameReader`]. `close()` wakes both; the socket is released when the
//! last of them drops its half.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedMutexGuard, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::TransportError;
use crate::identity::PeerId;
use crate::messages::{Frame, MAX_FRAME_SIZE};

/// Default timeout for establishing a TCP connection.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum entries in the address book.
const MAX_ADDRESS_BOOK_ENTRIES: NonZeroUsize = NonZeroUsize::new(10_000).unwrap();

/// Maximum tracked peer slots.
const MAX_PEER_SLOTS: NonZeroUsize = NonZeroUsize::new(1_000).unwrap();

/// Per-connection outbound queue depth.
const OUTBOUND_QUEUE_DEPTH: usize = 256;

// ============================================================================
// Streams and Dialers
// ============================================================================

pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens outbound byte streams.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self, addr: &str) -> io::Result<BoxedStream>;
}

#[derive(Clone, Debug)]
pub struct TcpDialer {
    connect_timeout: Duration,
}

impl TcpDialer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::new(DEFAULT_DIAL_TIMEOUT)
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &str) -> io::Result<BoxedStream> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

// ============================================================================
// Framing
// ============================================================================

/// Write one length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let bytes = frame.encode()?;
    write_encoded(writer, &bytes).await
}

async fn write_encoded<W>(writer: &mut W, bytes: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge {
            size: bytes.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    let len = bytes.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame. A clean EOF before the prefix is `Closed`.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, TransportError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(TransportError::Closed),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Frame::decode(&body)?)
}

// ============================================================================
// Connections
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    Active,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// A connected stream that has not been activated yet.
///
/// The handshake runs directly on it with [`RawConnection::send_frame`] and
/// [`RawConnection::recv_frame`].
pub struct RawConnection {
    stream: BoxedStream,
    remote_addr: String,
    direction: Direction,
    state: watch::Sender<ConnectionState>,
}

impl RawConnection {
    pub fn new(stream: BoxedStream, remote_addr: impl Into<String>, direction: Direction) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        Self {
            stream,
            remote_addr: remote_addr.into(),
            direction,
            state,
        }
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    pub async fn send_frame(&mut self, frame: &Frame) -> Result<(), TransportError> {
        write_frame(&mut self.stream, frame).await
    }

    pub async fn recv_frame(&mut self) -> Result<Frame, TransportError> {
        read_frame(&mut self.stream).await
    }
}

impl fmt::Debug for RawConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawConnection")
            .field("remote_addr", &self.remote_addr)
            .field("direction", &self.direction)
            .field("state", &self.state())
            .finish()
    }
}

struct ConnectionInner {
    id: ConnectionId,
    remote_addr: String,
    direction: Direction,
    peer_id: OnceLock<PeerId>,
    outbound: mpsc::Sender<Vec<u8>>,
    state: watch::Sender<ConnectionState>,
    shutdown: CancellationToken,
}

/// Cloneable handle to an active connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<ConnectionInner>,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn remote_addr(&self) -> &str {
        &self.inner.remote_addr
    }

    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    pub fn peer_id(&self) -> Option<PeerId> {
        self.inner.peer_id.get().copied()
    }

    /// Bind the connection to `peer`. Fails with the existing binding if it differs.
    pub fn bind_peer(&self, peer: PeerId) -> Result<(), PeerId> {
        let bound = *self.inner.peer_id.get_or_init(|| peer);
        if bound == peer { Ok(()) } else { Err(bound) }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        self.inner.shutdown.cancelled().await
    }

    /// Queue a frame for the writer task.
    pub async fn send_frame(&self, frame: &Frame) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let bytes = frame.encode()?;
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge {
                size: bytes.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        self.inner
            .outbound
            .send(bytes)
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Idempotent.
    pub fn close(&self) {
        if !self.inner.shutdown.is_cancelled() {
            self.inner.shutdown.cancel();
            self.inner.state.send_replace(ConnectionState::Closed);
            trace!(conn = %self.inner.id, addr = %self.inner.remote_addr, "connection closed");
        }
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("remote_addr", &self.inner.remote_addr)
            .field("peer_id", &self.peer_id())
            .field("state", &self.state())
            .finish()
    }
}

/// The read half of an active connection.
pub struct FrameReader {
    reader: ReadHalf<BoxedStream>,
    handle: ConnectionHandle,
}

impl FrameReader {
    /// Next inbound frame, or `Closed` once the connection is closed locally.
    pub async fn next_frame(&mut self) -> Result<Frame, TransportError> {
        let shutdown = self.handle.inner.shutdown.clone();
        tokio::select! {
            _ = shutdown.cancelled() => Err(TransportError::Closed),
            frame = read_frame(&mut self.reader) => frame,
        }
    }
}

async fn run_writer(
    mut writer: WriteHalf<BoxedStream>,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    handle: ConnectionHandle,
) {
    let shutdown = handle.inner.shutdown.clone();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            next = outbound.recv() => {
                let Some(bytes) = next else { break };
                if let Err(e) = write_encoded(&mut writer, &bytes).await {
                    debug!(conn = %handle.id(), error = %e, "write failed");
                    break;
                }
            }
        }
    }
    let _ = writer.shutdown().await;
    handle.close();
}

// ============================================================================
// Listener
// ============================================================================

pub struct Listener {
    inner: TcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let inner = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Listen {
                addr: addr.to_string(),
                source,
            })?;
        let local_addr = inner.local_addr()?;
        Ok(Self { inner, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn accept(&self) -> Result<RawConnection, TransportError> {
        let (stream, remote) = self.inner.accept().await?;
        stream.set_nodelay(true)?;
        Ok(RawConnection::new(Box::new(stream), remote.to_string(), Direction::Inbound))
    }
}

// ============================================================================
// Adapter
// ============================================================================

/// Exclusive access to a peer's connection slot.
pub type PeerSlot = OwnedMutexGuard<Option<ConnectionHandle>>;

type SlotCell = Arc<tokio::sync::Mutex<Option<ConnectionHandle>>>;

pub struct ConnectionAdapter {
    dialer: Arc<dyn Dialer>,
    address_book: Mutex<LruCache<PeerId, String>>,
    slots: Mutex<LruCache<PeerId, SlotCell>>,
    next_id: AtomicU64,
}

impl ConnectionAdapter {
    pub fn new(dialer: Arc<dyn Dialer>) -> Self {
        Self {
            dialer,
            address_book: Mutex::new(LruCache::new(MAX_ADDRESS_BOOK_ENTRIES)),
            slots: Mutex::new(LruCache::new(MAX_PEER_SLOTS)),
            next_id: AtomicU64::new(1),
        }
    }

    pub async fn listen(&self, addr: &str) -> Result<Listener, TransportError> {
        Listener::bind(addr).await
    }

    pub async fn dial(&self, addr: &str) -> Result<RawConnection, TransportError> {
        trace!(addr = %addr, "dialing");
        let stream = self
            .dialer
            .dial(addr)
            .await
            .map_err(|source| TransportError::Dial {
                addr: addr.to_string(),
                source,
            })?;
        Ok(RawConnection::new(stream, addr, Direction::Outbound))
    }

    /// Record `addr` for `peer` unless an address is already known.
    pub fn add_peer_id(&self, peer: PeerId, addr: impl Into<String>) {
        let mut book = self.lock_address_book();
        if !book.contains(&peer) {
            book.put(peer, addr.into());
        }
    }

    /// Record `addr` for `peer`, replacing any previous address.
    pub fn add_connection(&self, peer: PeerId, addr: impl Into<String>) {
        self.lock_address_book().put(peer, addr.into());
    }

    pub fn address_of(&self, peer: &PeerId) -> Option<String> {
        self.lock_address_book().get(peer).cloned()
    }

    pub fn forget(&self, peer: &PeerId) {
        self.lock_address_book().pop(peer);
        self.lock_slots().pop(peer);
    }

    /// Lock `peer`'s connection slot. Concurrent callers for the same peer
    /// queue here and see whatever the first one stored.
    pub async fn acquire(&self, peer: PeerId) -> PeerSlot {
        let cell = {
            let mut slots = self.lock_slots();
            slots
                .get_or_insert(peer, || Arc::new(tokio::sync::Mutex::new(None)))
                .clone()
        };
        cell.lock_owned().await
    }

    /// The live connection to `peer`, if one is installed and not busy.
    pub fn current(&self, peer: &PeerId) -> Option<ConnectionHandle> {
        let cell = self.lock_slots().get(peer).cloned()?;
        let slot = cell.try_lock().ok()?;
        slot.as_ref().filter(|c| !c.is_closed()).cloned()
    }

    /// Split an authenticated stream and start its writer task.
    pub fn activate(&self, raw: RawConnection, peer: Option<PeerId>) -> (ConnectionHandle, FrameReader) {
        let RawConnection {
            stream,
            remote_addr,
            direction,
            state,
        } = raw;

        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let peer_id = OnceLock::new();
        if let Some(peer) = peer {
            let _ = peer_id.set(peer);
        }
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        state.send_replace(ConnectionState::Active);

        let handle = ConnectionHandle {
            inner: Arc::new(ConnectionInner {
                id,
                remote_addr,
                direction,
                peer_id,
                outbound,
                state,
                shutdown: CancellationToken::new(),
            }),
        };

        let (reader, writer) = tokio::io::split(stream);
        tokio::spawn(run_writer(writer, outbound_rx, handle.clone()));

        debug!(
            conn = %id,
            addr = %handle.remote_addr(),
            peer = ?peer.map(|p| p.short()),
            direction = ?direction,
            "connection active"
        );
        let reader = FrameReader {
            reader,
            handle: handle.clone(),
        };
        (handle, reader)
    }

    pub async fn send(&self, conn: &ConnectionHandle, frame: &Frame) -> Result<(), TransportError> {
        conn.send_frame(frame).await
    }

    fn lock_address_book(&self) -> std::sync::MutexGuard<'_, LruCache<PeerId, String>> {
        self.address_book.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, LruCache<PeerId, SlotCell>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ConnectionAdapter {
    fn default() -> Self {
        Self::new(Arc::new(TcpDialer::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{MessageEnvelope, Proof};

    fn peer(byte: u8) -> PeerId {
        PeerId::from_bytes([byte; 32])
    }

    fn envelope(payload: &[u8]) -> Frame {
        Frame::Envelope(MessageEnvelope::one_way(peer(1), peer(2), 20, payload.to_vec()))
    }

    #[tokio::test]
    async fn frames_survive_a_duplex_stream() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        write_frame(&mut a, &envelope(b"one")).await.unwrap();
        write_frame(&mut a, &Frame::Proof(Proof { signature: vec![9; 64] })).await.unwrap();

        assert_eq!(read_frame(&mut b).await.unwrap(), envelope(b"one"));
        assert!(matches!(read_frame(&mut b).await.unwrap(), Frame::Proof(_)));

        drop(a);
        assert!(matches!(read_frame(&mut b).await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn oversized_frames_rejected_both_ways() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let huge = envelope(&vec![0u8; MAX_FRAME_SIZE + 1]);
        assert!(matches!(
            write_frame(&mut a, &huge).await,
            Err(TransportError::FrameTooLarge { .. })
        ));

        a.write_all(&((MAX_FRAME_SIZE as u32) + 1).to_be_bytes()).await.unwrap();
        assert!(matches!(
            read_frame(&mut b).await,
            Err(TransportError::FrameTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn tcp_dial_and_accept() {
        let adapter = ConnectionAdapter::default();
        let listener = adapter.listen("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().to_string();

        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        let mut outbound = adapter.dial(&addr).await.unwrap();
        let mut inbound = accept.await.unwrap();

        assert_eq!(outbound.direction(), Direction::Outbound);
        assert_eq!(inbound.direction(), Direction::Inbound);
        assert_eq!(inbound.state(), ConnectionState::Connecting);

        outbound.send_frame(&envelope(b"hello")).await.unwrap();
        assert_eq!(inbound.recv_frame().await.unwrap(), envelope(b"hello"));
    }

    #[tokio::test]
    async fn dial_failure_reports_address() {
        let adapter = ConnectionAdapter::new(Arc::new(TcpDialer::new(Duration::from_millis(500))));
        // Bind then drop to get a port nothing listens on.
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let addr = format!("127.0.0.1:{port}");
        match adapter.dial(&addr).await {
            Err(TransportError::Dial { addr: reported, .. }) => assert_eq!(reported, addr),
            other => panic!("expected dial error, got {other:?}"),
        }
    }

    #[test]
    fn address_book_semantics() {
        let adapter = ConnectionAdapter::default();
        adapter.add_peer_id(peer(1), "10.0.0.1:1");
        adapter.add_peer_id(peer(1), "10.0.0.1:2");
        assert_eq!(adapter.address_of(&peer(1)).as_deref(), Some("10.0.0.1:1"));

        adapter.add_connection(peer(1), "10.0.0.1:3");
        assert_eq!(adapter.address_of(&peer(1)).as_deref(), Some("10.0.0.1:3"));

        adapter.forget(&peer(1));
        assert_eq!(adapter.address_of(&peer(1)), None);
    }

    #[tokio::test]
    async fn activated_connection_exchanges_frames_and_closes() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let adapter = ConnectionAdapter::default();

        let raw_a = RawConnection::new(Box::new(a), "mem:a", Direction::Outbound);
        let raw_b = RawConnection::new(Box::new(b), "mem:b", Direction::Inbound);
        let (handle_a, _reader_a) = adapter.activate(raw_a, Some(peer(2)));
        let (handle_b, mut reader_b) = adapter.activate(raw_b, None);
        assert_ne!(handle_a.id(), handle_b.id());
        assert_eq!(handle_a.state(), ConnectionState::Active);
        assert_eq!(handle_a.peer_id(), Some(peer(2)));

        adapter.send(&handle_a, &envelope(b"queued")).await.unwrap();
        assert_eq!(reader_b.next_frame().await.unwrap(), envelope(b"queued"));

        assert_eq!(handle_b.bind_peer(peer(1)), Ok(()));
        assert_eq!(handle_b.bind_peer(peer(3)), Err(peer(1)));

        let mut state = handle_b.subscribe();
        handle_b.close();
        handle_b.close();
        assert_eq!(*state.borrow_and_update(), ConnectionState::Closed);
        assert!(matches!(reader_b.next_frame().await, Err(TransportError::Closed)));
        assert!(matches!(
            handle_b.send_frame(&envelope(b"late")).await,
            Err(TransportError::Closed)
        ));
        assert!(!handle_a.is_closed());
    }

    #[tokio::test]
    async fn peer_slot_is_single_flight() {
        let adapter = Arc::new(ConnectionAdapter::default());
        let mut first = adapter.acquire(peer(7)).await;

        let contender = {
            let adapter = adapter.clone();
            tokio::spawn(async move {
                let slot = adapter.acquire(peer(7)).await;
                slot.as_ref().map(|c| c.id())
            })
        };

        // The contender cannot proceed while we hold the slot.
        tokio::task::yield_now().await;
        assert!(!contender.is_finished());

        let (a, _b) = tokio::io::duplex(1024);
        let (handle, _reader) =
            adapter.activate(RawConnection::new(Box::new(a), "mem", Direction::Outbound), Some(peer(7)));
        *first = Some(handle.clone());
        drop(first);

        assert_eq!(contender.await.unwrap(), Some(handle.id()));
        assert_eq!(adapter.current(&peer(7)).map(|c| c.id()), Some(handle.id()));
    }
}
