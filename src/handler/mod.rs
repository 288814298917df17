//! Handler module - what happens to inbound packets.
//!
//! Every packet a client's session reads is handed to its [`PacketHandler`]
//! together with a handle to the client itself, so the handler can answer
//! (echoing the inbound seq), resolve a pending call, or both.
//!
//! Provided implementations:
//! - [`ResolveResponses`] - resolves every packet against the correlator
//!   (the default for dialing clients)
//! - [`handler_fn`] - wraps an async closure
//! - [`TypedHandler`] - MessagePack request in, MessagePack reply out
//!
//! # Example
//!
//! ```ignore
//! use seqlink::handler::handler_fn;
//!
//! // Echo server: answer "ping" with "pong", same seq.
//! let handler = handler_fn(|client: Client, packet: Packet| async move {
//!     client.async_write(packet.reply("pong"))?;
//!     Ok(())
//! });
//! ```

use std::future::Future;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::client::Client;
use crate::error::Result;
use crate::payload::MsgPack;
use crate::protocol::Packet;
use crate::BoxFuture;

/// Capability invoked once per received packet.
///
/// Errors are logged by the dispatch loop and never close the session.
pub trait PacketHandler: Send + Sync + 'static {
    /// Handle one inbound packet.
    fn on_packet(&self, client: Client, packet: Packet) -> BoxFuture<'static, Result<()>>;
}

/// Resolves every inbound packet as a response to a pending call.
///
/// Packets without a matching call are dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct ResolveResponses;

impl PacketHandler for ResolveResponses {
    fn on_packet(&self, client: Client, packet: Packet) -> BoxFuture<'static, Result<()>> {
        let seq = packet.seq;
        if !client.resolve(packet) {
            tracing::debug!(seq, remote = %client.remote_addr(), "Dropping unmatched packet");
        }
        Box::pin(async { Ok(()) })
    }
}

/// Handler backed by an async closure. Built by [`handler_fn`].
pub struct HandlerFn<F, Fut> {
    f: F,
    _phantom: PhantomData<fn() -> Fut>,
}

/// Turn `Fn(Client, Packet) -> impl Future<Output = Result<()>>` into a handler.
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F, Fut>
where
    F: Fn(Client, Packet) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    HandlerFn {
        f,
        _phantom: PhantomData,
    }
}

impl<F, Fut> PacketHandler for HandlerFn<F, Fut>
where
    F: Fn(Client, Packet) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn on_packet(&self, client: Client, packet: Packet) -> BoxFuture<'static, Result<()>> {
        Box::pin((self.f)(client, packet))
    }
}

/// Wrapper that decodes a MessagePack request, calls the handler and sends
/// the MessagePack-encoded result back with the request's seq.
///
/// Pairs with [`Client::request`](crate::Client::request).
pub struct TypedHandler<F, T, R, Fut> {
    handler: F,
    _phantom: PhantomData<fn(T) -> (R, Fut)>,
}

impl<F, T, R, Fut> TypedHandler<F, T, R, Fut>
where
    F: Fn(T, Client) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    /// Create a new typed handler.
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, T, R, Fut> PacketHandler for TypedHandler<F, T, R, Fut>
where
    F: Fn(T, Client) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    fn on_packet(&self, client: Client, packet: Packet) -> BoxFuture<'static, Result<()>> {
        let request: T = match MsgPack::decode(packet.payload()) {
            Ok(v) => v,
            Err(e) => return Box::pin(async move { Err(e) }),
        };

        let fut = (self.handler)(request, client.clone());
        Box::pin(async move {
            let response = fut.await?;
            let payload = MsgPack::encode(&response)?;
            client.async_write(packet.reply(payload))?;
            Ok(())
        })
    }
}
