//! One connection, two loops.
//!
//! A [`Session`] owns a byte stream exclusively and runs an independent read
//! loop and write loop against it:
//!
//! ```text
//!            ┌──────────── read loop ────────────┐
//! socket ──► │ codec.read_frame ─► codec.decode  │ ──► inbound queue ──► take_inbound()
//!            └───────────────────────────────────┘
//!            ┌──────────── write loop ───────────┐
//! socket ◄── │ batch ◄─ codec.encode             │ ◄── outbound queue ◄── write()
//!            └───────────────────────────────────┘
//! ```
//!
//! Both queues are bounded. A full inbound queue stalls the read loop (and so
//! the peer, through TCP flow control). A full outbound queue makes
//! [`Session::write`] fail immediately with [`SeqlinkError::QueueFull`].
//!
//! Lifecycle is an explicit `Open → Closing → Closed` state machine. Only
//! [`Session::close`] performs the transition, and only the call that wins it
//! releases the outbound queue and stops the loops, so close is safe from
//! either loop or any number of external callers.
//!
//! # Example
//!
//! ```ignore
//! let (reader, writer) = stream.into_split();
//! let session = Session::spawn(reader, writer, &config, Arc::new(LengthPrefixedCodec::new()))?;
//! let mut inbound = session.take_inbound().unwrap();
//!
//! session.write(Packet::with_seq(1, "hello"))?;
//! while let Some(packet) = inbound.recv().await {
//!     // ...
//! }
//! ```

mod writer;

pub use writer::MAX_BATCH_SIZE;

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::codec::Codec;
use crate::config::Config;
use crate::error::{Result, SeqlinkError};
use crate::protocol::Packet;

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    /// Loops running, writes accepted.
    Open = 0,
    /// `close()` is tearing the session down.
    Closing = 1,
    /// Terminal.
    Closed = 2,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Open,
            1 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// A running connection.
pub struct Session {
    peer: String,
    state: AtomicU8,
    outbound: Mutex<Option<mpsc::Sender<Packet>>>,
    inbound: Mutex<Option<mpsc::Receiver<Packet>>>,
    shutdown: watch::Sender<bool>,
    codec: Arc<dyn Codec>,
    idle_duration: Duration,
    created: Instant,
    /// Milliseconds after `created` at which the last frame arrived.
    last_frame_ms: AtomicU64,
}

impl Session {
    /// Start the read and write loops over a pair of stream halves.
    ///
    /// Must be called from within a tokio runtime. Fails with
    /// [`SeqlinkError::InvalidConfig`] if `config` does not validate.
    pub fn spawn<R, W>(
        reader: R,
        writer: W,
        config: &Config,
        codec: Arc<dyn Codec>,
    ) -> Result<Arc<Self>>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::spawn_labeled(reader, writer, config, codec, "stream".to_string())
    }

    /// Start a session over a connected TCP stream.
    pub fn from_tcp(stream: TcpStream, config: &Config, codec: Arc<dyn Codec>) -> Result<Arc<Self>> {
        let peer = stream
            .peer_addr()
            .map(|addr: SocketAddr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let (reader, writer) = stream.into_split();
        Self::spawn_labeled(reader, writer, config, codec, peer)
    }

    fn spawn_labeled<R, W>(
        reader: R,
        writer: W,
        config: &Config,
        codec: Arc<dyn Codec>,
        peer: String,
    ) -> Result<Arc<Self>>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        config.validate()?;

        let (out_tx, out_rx) = mpsc::channel(config.write_queue_capacity);
        let (in_tx, in_rx) = mpsc::channel(config.read_queue_capacity);
        let (shutdown, _) = watch::channel(false);

        let session = Arc::new(Self {
            peer,
            state: AtomicU8::new(SessionState::Open as u8),
            outbound: Mutex::new(Some(out_tx)),
            inbound: Mutex::new(Some(in_rx)),
            shutdown,
            codec,
            idle_duration: config.idle_duration,
            created: Instant::now(),
            last_frame_ms: AtomicU64::new(0),
        });

        let reader = BufReader::with_capacity(config.read_buffer_size, reader);
        tokio::spawn(read_loop(
            session.clone(),
            reader,
            in_tx,
            session.shutdown.subscribe(),
        ));
        tokio::spawn(writer::write_loop(
            session.clone(),
            writer,
            out_rx,
            session.shutdown.subscribe(),
            config.write_buffer_size,
        ));

        tracing::debug!(peer = %session.peer, "Session opened");
        Ok(session)
    }

    /// Queue a packet for sending without waiting.
    ///
    /// # Errors
    ///
    /// - [`SeqlinkError::Closed`] if the session is not open
    /// - [`SeqlinkError::QueueFull`] if the outbound queue is at capacity
    /// - whatever the codec's `validate` rejects
    pub fn write(&self, packet: Packet) -> Result<()> {
        if self.state() != SessionState::Open {
            return Err(SeqlinkError::Closed);
        }
        self.codec.validate(&packet)?;

        let outbound = self.outbound.lock();
        let tx = outbound.as_ref().ok_or(SeqlinkError::Closed)?;
        tx.try_send(packet).map_err(|e| match e {
            TrySendError::Full(_) => SeqlinkError::QueueFull,
            TrySendError::Closed(_) => SeqlinkError::Closed,
        })
    }

    /// Take the receiving end of the inbound queue. Returns `None` after the
    /// first call.
    pub fn take_inbound(&self) -> Option<mpsc::Receiver<Packet>> {
        self.inbound.lock().take()
    }

    /// Close the session.
    ///
    /// Returns `true` for the one call that performed the transition; every
    /// other call is a no-op returning `false`.
    pub fn close(&self) -> bool {
        let won = self
            .state
            .compare_exchange(
                SessionState::Open as u8,
                SessionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if !won {
            return false;
        }

        self.outbound.lock().take();
        self.shutdown.send_replace(true);
        self.state.store(SessionState::Closed as u8, Ordering::Release);

        tracing::debug!(peer = %self.peer, "Session closed");
        true
    }

    /// Wait until the session has been closed.
    pub async fn closed(&self) {
        let mut rx = self.shutdown.subscribe();
        wait_closed(&mut rx).await;
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// `true` once `close()` has started.
    pub fn is_closed(&self) -> bool {
        self.state() != SessionState::Open
    }

    /// `true` if no frame arrived within the idle duration.
    ///
    /// Always `false` when the idle duration is zero.
    pub fn is_idle(&self) -> bool {
        if self.idle_duration.is_zero() {
            return false;
        }
        let last = self.created + Duration::from_millis(self.last_frame_ms.load(Ordering::Relaxed));
        Instant::now().saturating_duration_since(last) >= self.idle_duration
    }

    /// Free slots in the outbound queue (0 once closed).
    pub fn outbound_capacity(&self) -> usize {
        self.outbound
            .lock()
            .as_ref()
            .map_or(0, |tx| tx.capacity())
    }

    /// Label of the remote end used in log events.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    fn touch(&self) {
        let elapsed = Instant::now().saturating_duration_since(self.created);
        self.last_frame_ms
            .store(elapsed.as_millis() as u64, Ordering::Relaxed);
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}

/// Resolve once the shutdown flag is set (or its sender is gone).
async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closed| *closed).await;
}

async fn read_loop<R>(
    session: Arc<Session>,
    mut reader: BufReader<R>,
    inbound: mpsc::Sender<Packet>,
    mut shutdown: watch::Receiver<bool>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = wait_closed(&mut shutdown) => break,
            frame = session.codec.read_frame(&mut reader) => frame,
        };

        let packet = match frame.and_then(|raw| session.codec.decode(raw)) {
            Ok(packet) => packet,
            Err(SeqlinkError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                tracing::debug!(peer = %session.peer, "Peer closed connection");
                break;
            }
            Err(e) => {
                tracing::warn!(peer = %session.peer, error = %e, "Read failed, closing session");
                break;
            }
        };

        session.touch();

        tokio::select! {
            biased;
            _ = wait_closed(&mut shutdown) => break,
            sent = inbound.send(packet) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }

    session.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::LengthPrefixedCodec;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn codec() -> Arc<dyn Codec> {
        Arc::new(LengthPrefixedCodec::new())
    }

    fn open(config: &Config) -> (Arc<Session>, DuplexStream) {
        let (local, peer) = duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(local);
        (Session::spawn(reader, writer, config, codec()).unwrap(), peer)
    }

    #[tokio::test]
    async fn test_write_reaches_peer() {
        let (session, mut peer) = open(&Config::default());
        session.write(Packet::with_seq(7, "ab")).unwrap();

        let mut buf = [0u8; 14];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0, 0, 0, 10, 0, 0, 0, 7, 0, 0, 0, 2, b'a', b'b']);
    }

    #[tokio::test]
    async fn test_inbound_preserves_arrival_order() {
        let (session, mut peer) = open(&Config::default());
        let mut inbound = session.take_inbound().unwrap();
        assert!(session.take_inbound().is_none());

        let codec = LengthPrefixedCodec::new();
        for i in 0..3 {
            peer.write_all(&codec.encode(&Packet::with_seq(i, format!("m{i}"))))
                .await
                .unwrap();
        }

        for i in 0..3 {
            let packet = inbound.recv().await.unwrap();
            assert_eq!(packet.seq, i);
            assert_eq!(packet.payload(), format!("m{i}").as_bytes());
        }
    }

    #[tokio::test]
    async fn test_full_queue_fails_fast() {
        let config = Config::default().with_queue_capacities(4, 4);
        let (session, _peer) = open(&config);

        // The write loop has not been polled yet on this single-threaded runtime.
        for i in 0..4 {
            session.write(Packet::with_seq(i, "x")).unwrap();
        }
        assert!(matches!(
            session.write(Packet::with_seq(4, "x")),
            Err(SeqlinkError::QueueFull)
        ));
        assert_eq!(session.outbound_capacity(), 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (session, _peer) = open(&Config::default());

        assert!(session.close());
        assert!(!session.close());
        assert_eq!(session.state(), SessionState::Closed);
        assert!(matches!(
            session.write(Packet::new("late")),
            Err(SeqlinkError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_close_ends_stream_for_peer() {
        let (session, mut peer) = open(&Config::default());
        session.close();

        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(1), peer.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_peer_eof_closes_session() {
        let (session, peer) = open(&Config::default());
        drop(peer);

        tokio::time::timeout(Duration::from_secs(1), session.closed())
            .await
            .unwrap();
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_malformed_frame_closes_session() {
        let (session, mut peer) = open(&Config::default());
        // frame length 3 is shorter than the header
        peer.write_all(&[0, 0, 0, 3, 1, 2, 3]).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), session.closed())
            .await
            .unwrap();
        assert!(session.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_tracks_inbound_frames() {
        let config = Config::default().with_idle_duration(Duration::from_secs(5));
        let (session, mut peer) = open(&config);
        let mut inbound = session.take_inbound().unwrap();

        assert!(!session.is_idle());
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(session.is_idle());

        let frame = LengthPrefixedCodec::new().encode(&Packet::with_seq(1, "beat"));
        peer.write_all(&frame).await.unwrap();
        inbound.recv().await.unwrap();
        assert!(!session.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_idle_duration_disables_detection() {
        let config = Config::default().with_idle_duration(Duration::ZERO);
        let (session, _peer) = open(&config);

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(!session.is_idle());
    }

    #[tokio::test]
    async fn test_spawn_rejects_zero_capacity() {
        let (local, _peer) = duplex(1024);
        let (reader, writer) = tokio::io::split(local);
        let config = Config::default().with_queue_capacities(0, 0);

        let result = Session::spawn(reader, writer, &config, codec());
        assert!(matches!(result, Err(SeqlinkError::InvalidConfig(_))));
    }
}
