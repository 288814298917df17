//! # seqlink
//!
//! Correlated request/response messaging over TCP.
//!
//! Every packet carries a sequence id. A request sent without one gets a
//! fresh id and a pending slot; the packet coming back with the same id
//! completes the call. Packets that nobody waits for go to a handler.
//!
//! ## Architecture
//!
//! - **Codec**: frames packets on the wire (`[u32 len][i32 seq][i32 dataLen][payload]`
//!   by default, a line format as an alternative)
//! - **Session**: one connection, with a read task and a batching write task
//!   behind bounded queues
//! - **Client**: session + correlator + handler dispatch + reconnect
//! - **Server**: accept loop spawning one client worker per connection
//! - **Registry**: clients by address and group, reconnected with
//!   exponential backoff when they close
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use seqlink::{handler_fn, Client, Config, LengthPrefixedCodec, Packet, Server};
//!
//! #[tokio::main]
//! async fn main() -> seqlink::Result<()> {
//!     let server = Server::new(
//!         "127.0.0.1:0",
//!         Config::default(),
//!         Arc::new(LengthPrefixedCodec::new()),
//!         Arc::new(handler_fn(|client, packet| async move {
//!             client.async_write(packet.reply("pong"))?;
//!             Ok(())
//!         })),
//!     );
//!     let addr = server.listen_and_serve().await?;
//!
//!     let client = Client::builder(addr.to_string()).connect().await?;
//!     let pong = client.sync_write(Packet::new("ping"), Duration::from_secs(2)).await?;
//!     assert_eq!(pong.payload(), b"pong");
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::pin::Pin;

pub mod codec;
pub mod config;
pub mod correlator;
pub mod error;
pub mod handler;
pub mod payload;
pub mod protocol;
pub mod reconnect;
pub mod registry;
pub mod session;

mod client;
mod server;
mod transport;

/// Boxed, sendable future used at trait seams.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub use client::{Client, ClientBuilder};
pub use codec::{Codec, LengthPrefixedCodec, LineCodec};
pub use config::{Config, DispatchMode};
pub use correlator::{Correlator, PendingCall};
pub use error::{Result, SeqlinkError};
pub use handler::{handler_fn, PacketHandler, ResolveResponses, TypedHandler};
pub use payload::MsgPack;
pub use protocol::Packet;
pub use reconnect::{Reconnect, ReconnectOutcome, ReconnectScheduler};
pub use registry::{ClientGroup, ClientRegistry};
pub use server::Server;
pub use session::{Session, SessionState};
