//! # Surge Protocols
//!
//! Client side of every protocol Surge can drive, behind one trait:
//!
//! ```text
//!   ┌───────────────────────────── ClientSet (per worker) ─────────────────────────────┐
//!   │ Http1Client  Http2Client  GrpcClient  GraphQlClient  WsClient  UdpClient  (H3/Br) │
//!   │      │            │            │            │           │          │              │
//!   │      │       h2 engine ◄───────┘            │           │          │              │
//!   │      └───────────────────────◄──────────────┘           │          │              │
//!   │  Pool<Http1Connection>  Pool<H2Connection>              │     Pool<UdpConn>       │
//!   │      └──────── Stream::dial (TCP / TLS + ALPN) ◄────────┘          │              │
//!   │                         DnsCache (single flight) ◄─────────────────┘              │
//!   └──────────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every `execute` produces exactly one [`surge_core::OpResult`]; network
//! failures are data, never panics or `Err`s.

pub mod client;
pub mod dns;
pub mod graphql;
pub mod grpc;
pub mod h2;
pub mod http1;
pub mod http2;
pub mod pool;
pub mod tls;
pub mod transport;
pub mod udp;
pub mod websocket;

pub use client::{ClientConfig, ClientSet, Outcome, ProtocolClient, Response, UnsupportedClient};
pub use dns::{DnsCache, DnsStats, Resolver, SystemResolver};
pub use graphql::GraphQlClient;
pub use grpc::GrpcClient;
pub use http1::Http1Client;
pub use http2::Http2Client;
pub use pool::{Pool, PoolStats, Poolable, Pooled};
pub use tls::{Alpn, TlsConnector};
pub use transport::Stream;
pub use udp::UdpClient;
pub use websocket::WsClient;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::client::{ClientConfig, ClientSet, Outcome, ProtocolClient, Response};
    pub use crate::dns::DnsCache;
}
