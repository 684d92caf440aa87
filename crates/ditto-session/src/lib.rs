//! A Ditto client session over one multiplexed connection.
//!
//! [`DittoSession`] wires the `ditto-core` machinery to a [`Transport`]:
//! correlated requests, acknowledgement aggregation, consumption
//! handshakes, change handlers, search subscriptions, reconnects and token
//! pushes.

/// Environment-backed session configuration.
pub mod config;
/// Session lifecycle, outbound operations and inbound routing.
pub mod session;
/// Connection seam and the in-process transport.
pub mod transport;

pub use config::{ConfigError, SessionConfig};
pub use session::{DittoSession, Executors, Response};
pub use transport::{MemoryConnection, MemoryPeer, MemoryTransport, Transport, TransportLink};
