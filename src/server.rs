//! TCP server: one [`Client`] worker per accepted connection.
//!
//! Workers share the server's configuration, codec and handler (all
//! read-only) and nothing else. Shutting the server down stops accepting;
//! workers that are already running keep going until they or their peers
//! close.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use seqlink::{handler_fn, Config, LengthPrefixedCodec, Server};
//!
//! let echo = handler_fn(|client, packet| async move {
//!     client.async_write(packet.reply("pong"))?;
//!     Ok(())
//! });
//!
//! let server = Server::new(
//!     "0.0.0.0:7000",
//!     Config::default(),
//!     Arc::new(LengthPrefixedCodec::new()),
//!     Arc::new(echo),
//! );
//! let addr = server.listen_and_serve().await?;
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::client::Client;
use crate::codec::Codec;
use crate::config::Config;
use crate::error::{Result, SeqlinkError};
use crate::handler::PacketHandler;
use crate::transport;

/// Pause after a failed accept before trying again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

enum ServerState {
    Idle,
    Starting,
    Listening {
        local_addr: SocketAddr,
        shutdown: watch::Sender<bool>,
    },
    Stopped,
}

/// Accepts connections and spawns a worker for each.
pub struct Server {
    addr: String,
    config: Arc<Config>,
    codec: Arc<dyn Codec>,
    handler: Arc<dyn PacketHandler>,
    state: Mutex<ServerState>,
}

impl Server {
    /// Create a server for `addr` (`host:port`, port 0 picks a free port).
    pub fn new(
        addr: impl Into<String>,
        config: Config,
        codec: Arc<dyn Codec>,
        handler: Arc<dyn PacketHandler>,
    ) -> Self {
        Self {
            addr: addr.into(),
            config: Arc::new(config),
            codec,
            handler,
            state: Mutex::new(ServerState::Idle),
        }
    }

    /// Bind and start the accept loop in the background.
    ///
    /// Returns the bound address once listening.
    ///
    /// # Errors
    ///
    /// - [`SeqlinkError::AlreadyListening`] if called twice
    /// - [`SeqlinkError::Closed`] after [`Server::shutdown`]
    /// - I/O errors from resolving or binding (the server may be retried)
    pub async fn listen_and_serve(&self) -> Result<SocketAddr> {
        self.config.validate()?;

        {
            let mut state = self.state.lock();
            match &*state {
                ServerState::Idle => {}
                ServerState::Stopped => return Err(SeqlinkError::Closed),
                _ => return Err(SeqlinkError::AlreadyListening),
            }
            *state = ServerState::Starting;
        }

        let (listener, local_addr) = match self.bind().await {
            Ok(bound) => bound,
            Err(e) => {
                let mut state = self.state.lock();
                if matches!(*state, ServerState::Starting) {
                    *state = ServerState::Idle;
                }
                return Err(e);
            }
        };

        let (shutdown, shutdown_rx) = watch::channel(false);
        {
            let mut state = self.state.lock();
            if !matches!(*state, ServerState::Starting) {
                // shut down while binding
                return Err(SeqlinkError::Closed);
            }
            *state = ServerState::Listening {
                local_addr,
                shutdown,
            };
        }

        tokio::spawn(accept_loop(
            listener,
            shutdown_rx,
            self.config.clone(),
            self.codec.clone(),
            self.handler.clone(),
        ));

        tracing::info!(local = %local_addr, "Server listening");
        Ok(local_addr)
    }

    async fn bind(&self) -> Result<(TcpListener, SocketAddr)> {
        let addr = transport::resolve(&self.addr).await?;
        let listener = transport::bind(addr, &self.config)?;
        let local_addr = listener.local_addr()?;
        Ok((listener, local_addr))
    }

    /// Stop accepting and close the listening socket.
    ///
    /// Idempotent. Returns `true` if this call stopped a running listener.
    pub fn shutdown(&self) -> bool {
        let previous = std::mem::replace(&mut *self.state.lock(), ServerState::Stopped);
        match previous {
            ServerState::Listening {
                local_addr,
                shutdown,
            } => {
                shutdown.send_replace(true);
                tracing::info!(local = %local_addr, "Server shut down");
                true
            }
            _ => false,
        }
    }

    /// Bound address while listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match *self.state.lock() {
            ServerState::Listening { local_addr, .. } => Some(local_addr),
            _ => None,
        }
    }

    /// Whether the accept loop is running.
    pub fn is_listening(&self) -> bool {
        self.local_addr().is_some()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
    config: Arc<Config>,
    codec: Arc<dyn Codec>,
    handler: Arc<dyn PacketHandler>,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = stopped(&mut shutdown) => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!(remote = %peer, error = %e, "Failed to set TCP_NODELAY");
                }
                match Client::accept(stream, config.clone(), codec.clone(), handler.clone()) {
                    Ok(_) => tracing::debug!(remote = %peer, "Accepted connection"),
                    Err(e) => tracing::warn!(remote = %peer, error = %e, "Failed to start worker"),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Accept failed");
                tokio::select! {
                    biased;
                    _ = stopped(&mut shutdown) => break,
                    _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => {}
                }
            }
        }
    }

    tracing::debug!("Accept loop stopped");
}

async fn stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stopped| *stopped).await;
}
