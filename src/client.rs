//! Client: one session plus correlation and dispatch.
//!
//! A [`Client`] wraps a [`Session`] with:
//! 1. a [`Correlator`] so requests without a seq get one and their responses
//!    find their way back to the caller
//! 2. a dispatch loop handing every inbound packet to the [`PacketHandler`]
//! 3. reconnection to the same remote address, keeping handler and
//!    correlator across the swap
//!
//! `Client` is a cheap handle (`Clone` shares the same connection). Handlers
//! receive one for every packet, which is how they answer.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use seqlink::{Client, Packet};
//!
//! #[tokio::main]
//! async fn main() -> seqlink::Result<()> {
//!     let client = Client::builder("127.0.0.1:7000").connect().await?;
//!
//!     let pong = client
//!         .sync_write(Packet::new("ping"), Duration::from_secs(2))
//!         .await?;
//!     assert_eq!(pong.payload(), b"pong");
//!
//!     client.close();
//!     Ok(())
//! }
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;

use crate::codec::{Codec, LengthPrefixedCodec};
use crate::config::{Config, DispatchMode};
use crate::correlator::{Correlator, PendingCall};
use crate::error::{Result, SeqlinkError};
use crate::handler::{PacketHandler, ResolveResponses};
use crate::payload::MsgPack;
use crate::protocol::Packet;
use crate::reconnect::Reconnect;
use crate::session::Session;
use crate::transport;
use crate::BoxFuture;

/// Builder for connecting a [`Client`].
///
/// Defaults: [`Config::default`], [`LengthPrefixedCodec`],
/// [`ResolveResponses`] and a private correlator.
pub struct ClientBuilder {
    addr: String,
    config: Config,
    codec: Arc<dyn Codec>,
    handler: Arc<dyn PacketHandler>,
    correlator: Option<Arc<Correlator>>,
}

impl ClientBuilder {
    /// Create a builder for `addr` (`host:port`).
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            config: Config::default(),
            codec: Arc::new(LengthPrefixedCodec::new()),
            handler: Arc::new(ResolveResponses),
            correlator: None,
        }
    }

    /// Set the configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Set the wire codec.
    pub fn codec(mut self, codec: impl Codec) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    /// Set the packet handler.
    pub fn handler(mut self, handler: impl PacketHandler) -> Self {
        self.handler = Arc::new(handler);
        self
    }

    /// Use `correlator` instead of a private one, e.g. to share one id space
    /// across several clients.
    pub fn correlator(mut self, correlator: Arc<Correlator>) -> Self {
        self.correlator = Some(correlator);
        self
    }

    /// Dial and start the client.
    pub async fn connect(self) -> Result<Client> {
        // 1. Validate config
        self.config.validate()?;
        let config = Arc::new(self.config);

        // 2. Resolve and dial
        let remote_addr = transport::resolve(&self.addr).await?;
        let stream = transport::dial(remote_addr, &config).await?;

        // 3. Start session and dispatch loop
        let correlator = self
            .correlator
            .unwrap_or_else(|| Arc::new(Correlator::new(config.max_seq)));
        let client = Client::start(
            stream,
            remote_addr,
            config,
            self.codec,
            self.handler,
            correlator,
        )?;

        tracing::debug!(remote = %remote_addr, local = %client.local_addr(), "Client connected");
        Ok(client)
    }
}

struct ClientInner {
    config: Arc<Config>,
    codec: Arc<dyn Codec>,
    handler: Arc<dyn PacketHandler>,
    correlator: Arc<Correlator>,
    /// Worker pool for unordered dispatch; `None` in ordered mode.
    workers: Option<Arc<Semaphore>>,
    remote_addr: SocketAddr,
    local_addr: RwLock<SocketAddr>,
    session: RwLock<Arc<Session>>,
    reconnecting: tokio::sync::Mutex<()>,
    last_heartbeat: Mutex<Instant>,
}

/// A connected endpoint.
///
/// Dialing clients come from [`Client::connect`] or [`Client::builder`];
/// servers create one per accepted connection. A client stays alive until it
/// is closed or its peer goes away, even if every handle is dropped.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Create a builder for `addr`.
    pub fn builder(addr: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(addr)
    }

    /// Dial `addr` with an explicit config, codec and handler.
    pub async fn connect(
        addr: &str,
        config: Config,
        codec: Arc<dyn Codec>,
        handler: Arc<dyn PacketHandler>,
    ) -> Result<Client> {
        let mut builder = ClientBuilder::new(addr).config(config);
        builder.codec = codec;
        builder.handler = handler;
        builder.connect().await
    }

    /// Wrap an accepted connection (server side).
    pub(crate) fn accept(
        stream: TcpStream,
        config: Arc<Config>,
        codec: Arc<dyn Codec>,
        handler: Arc<dyn PacketHandler>,
    ) -> Result<Client> {
        let remote_addr = stream.peer_addr()?;
        let correlator = Arc::new(Correlator::new(config.max_seq));
        Self::start(stream, remote_addr, config, codec, handler, correlator)
    }

    fn start(
        stream: TcpStream,
        remote_addr: SocketAddr,
        config: Arc<Config>,
        codec: Arc<dyn Codec>,
        handler: Arc<dyn PacketHandler>,
        correlator: Arc<Correlator>,
    ) -> Result<Client> {
        let local_addr = stream.local_addr()?;
        let session = Session::from_tcp(stream, &config, codec.clone())?;
        let workers = match config.dispatch {
            DispatchMode::Ordered => None,
            DispatchMode::Unordered { max_concurrent } => {
                Some(Arc::new(Semaphore::new(max_concurrent)))
            }
        };

        let client = Client {
            inner: Arc::new(ClientInner {
                config,
                codec,
                handler,
                correlator,
                workers,
                remote_addr,
                local_addr: RwLock::new(local_addr),
                session: RwLock::new(session.clone()),
                reconnecting: tokio::sync::Mutex::new(()),
                last_heartbeat: Mutex::new(Instant::now()),
            }),
        };
        client.spawn_dispatch(&session);
        Ok(client)
    }

    fn spawn_dispatch(&self, session: &Session) {
        if let Some(inbound) = session.take_inbound() {
            tokio::spawn(dispatch_loop(self.clone(), inbound));
        }
    }

    /// Current session.
    pub fn session(&self) -> Arc<Session> {
        self.inner.session.read().clone()
    }

    /// Send a packet.
    ///
    /// A packet that already carries a seq (`seq >= 0`, typically a response
    /// built with [`Packet::reply`]) is queued as is and `None` is returned.
    /// Otherwise a fresh seq is allocated and stamped onto the packet, and
    /// the returned [`PendingCall`] yields the response.
    ///
    /// If queueing fails the registration is removed before the error is
    /// returned.
    pub fn async_write(&self, packet: Packet) -> Result<Option<PendingCall>> {
        if packet.is_assigned() {
            self.session().write(packet)?;
            return Ok(None);
        }
        self.begin_call(packet).map(Some)
    }

    fn begin_call(&self, mut packet: Packet) -> Result<PendingCall> {
        let call = self.inner.correlator.begin()?;
        packet.seq = call.seq();

        if let Err(e) = self.session().write(packet) {
            self.inner.correlator.deregister(call.seq(), call.call_id());
            return Err(e);
        }
        Ok(call)
    }

    /// Send a request and wait up to `timeout` for its response.
    ///
    /// The request always gets a freshly allocated seq; any seq already on
    /// `packet` is overwritten. On timeout the pending registration is
    /// removed, so a late response is silently dropped.
    pub async fn sync_write(&self, packet: Packet, timeout: Duration) -> Result<Packet> {
        let call = self.begin_call(packet)?;
        let (seq, call_id) = (call.seq(), call.call_id());

        match tokio::time::timeout(timeout, call.wait()).await {
            Ok(result) => result,
            Err(_) => {
                self.inner.correlator.deregister(seq, call_id);
                tracing::debug!(remote = %self.inner.remote_addr, seq, "Call timed out");
                Err(SeqlinkError::Timeout(timeout))
            }
        }
    }

    /// Deliver `packet` to the call waiting on its seq.
    ///
    /// Returns `false` if no call was waiting. Meant for handlers.
    pub fn resolve(&self, packet: Packet) -> bool {
        self.inner.correlator.resolve(packet.seq, packet)
    }

    /// Typed call: MessagePack-encode `request`, wait for the reply and
    /// decode it.
    pub async fn request<Req, Resp>(&self, request: &Req, timeout: Duration) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let payload = MsgPack::encode(request)?;
        let response = self.sync_write(Packet::new(payload), timeout).await?;
        MsgPack::decode(response.payload())
    }

    /// Heartbeat round trip.
    ///
    /// Sends `heartbeat` as a request and, once answered, records the time
    /// returned by [`Client::last_heartbeat`]. Returns the round-trip time.
    pub async fn ping(&self, heartbeat: Packet, timeout: Duration) -> Result<Duration> {
        let started = Instant::now();
        self.sync_write(heartbeat, timeout).await?;

        let now = Instant::now();
        let mut last = self.inner.last_heartbeat.lock();
        if now > *last {
            *last = now;
        }
        Ok(now - started)
    }

    /// When the last successful [`Client::ping`] completed (creation time if
    /// none has).
    pub fn last_heartbeat(&self) -> Instant {
        *self.inner.last_heartbeat.lock()
    }

    /// Re-dial the remote address and replace the session.
    ///
    /// Concurrent calls are serialized; a call that finds the session open
    /// returns `Ok` without dialing. The handler and the correlator carry
    /// over, so calls pending across the swap can still be answered.
    pub async fn reconnect(&self) -> Result<()> {
        let _guard = self.inner.reconnecting.lock().await;
        if !self.session().is_closed() {
            return Ok(());
        }

        let stream = transport::dial(self.inner.remote_addr, &self.inner.config).await?;
        let local_addr = stream.local_addr()?;
        let session = Session::from_tcp(stream, &self.inner.config, self.inner.codec.clone())?;

        *self.inner.session.write() = session.clone();
        *self.inner.local_addr.write() = local_addr;
        self.spawn_dispatch(&session);

        tracing::debug!(remote = %self.inner.remote_addr, local = %local_addr, "Client reconnected");
        Ok(())
    }

    /// Close the current session. Returns `true` if this call closed it.
    ///
    /// A client tracked by a [`ClientRegistry`](crate::ClientRegistry) will be
    /// reconnected by its supervisor; remove it from the registry first to
    /// retire it.
    pub fn close(&self) -> bool {
        self.session().close()
    }

    /// Whether the current session is closed.
    pub fn is_closed(&self) -> bool {
        self.session().is_closed()
    }

    /// Whether the current session has been silent for the idle duration.
    pub fn is_idle(&self) -> bool {
        self.session().is_idle()
    }

    /// Local address of the current connection.
    pub fn local_addr(&self) -> SocketAddr {
        *self.inner.local_addr.read()
    }

    /// Remote address (stable across reconnects).
    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    /// The correlator used for this client's calls.
    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.inner.correlator
    }

    /// Configuration in effect.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("remote_addr", &self.inner.remote_addr)
            .field("local_addr", &self.local_addr())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Reconnect for Client {
    fn target(&self) -> String {
        self.inner.remote_addr.to_string()
    }

    fn reconnect(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(Client::reconnect(self))
    }
}

/// Drain one session's inbound queue into the handler. Ends with the session.
async fn dispatch_loop(client: Client, mut inbound: mpsc::Receiver<Packet>) {
    while let Some(packet) = inbound.recv().await {
        let seq = packet.seq;
        match &client.inner.workers {
            None => {
                let result = client.inner.handler.on_packet(client.clone(), packet).await;
                log_handler_result(&client, seq, result);
            }
            Some(workers) => {
                // Waiting here pushes backpressure onto the inbound queue.
                let Ok(permit) = workers.clone().acquire_owned().await else {
                    break;
                };
                let fut = client.inner.handler.on_packet(client.clone(), packet);
                let worker = client.clone();
                tokio::spawn(async move {
                    let result = fut.await;
                    drop(permit);
                    log_handler_result(&worker, seq, result);
                });
            }
        }
    }

    tracing::debug!(remote = %client.inner.remote_addr, "Dispatch loop stopped");
}

fn log_handler_result(client: &Client, seq: i32, result: Result<()>) {
    if let Err(e) = result {
        tracing::error!(remote = %client.inner.remote_addr, seq, error = %e, "Handler failed");
    }
}
