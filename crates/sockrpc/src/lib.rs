//! sockrpc: bidirectional JSON-RPC over a single persistent message
//! connection.
//!
//! Both ends of a connection can call methods on each other, push
//! fire-and-forget events, and multiplex any number of concurrent calls over
//! one transport. This crate defines:
//! - Wire classification and argument splitting ([`Inbound`], [`Args`])
//! - The route registry and exposure tables ([`RouteRegistry`],
//!   [`RouteHandler`], [`MethodTable`], [`MaskPolicy`])
//! - The session engine ([`Session`], [`Proxy`])
//! - Pluggable encoding ([`Codec`], [`SerializerRegistry`])
//! - Transports ([`Transport`]; WebSocket behind the `websocket` feature)
//! - The accepting endpoint and dialing client ([`Endpoint`], [`Client`])

mod client;
mod config;
mod endpoint;
mod error;
mod execution;
mod message;
mod pending;
mod route;
mod serializer;
mod session;
pub mod transport;

pub use client::Client;
pub use config::SessionConfig;
pub use endpoint::Endpoint;
pub use error::{
    AcceptError, CallError, EncodeError, HandlerError, ProtocolError, RemoteError, RouteError,
    TransportError,
};
pub use execution::ExecutionStrategy;
pub use message::{Args, ErrorFrame, Inbound};
pub use pending::Role;
pub use route::{
    Classification, HandlerFuture, MaskPolicy, MethodTable, MethodTableBuilder, RouteHandler,
    RouteRegistry, INIT_METHOD,
};
pub use serializer::{Codec, SerializerRegistry};
pub use session::{ListenerId, Proxy, Session};
pub use transport::{Transport, WireFrame};
