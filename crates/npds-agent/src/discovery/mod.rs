//! Policy discovery: transports, reconnect backoff and the ACK/NACK client.

pub mod backoff;
pub mod client;
pub mod grpc;
pub mod http;
pub mod memory;
pub mod transport;

pub use backoff::{Backoff, BackoffConfig};
pub use client::{ClientState, DiscoveryClient, DiscoverySettings, ResourceBatch};
pub use grpc::GrpcTransport;
pub use http::HttpFetchTransport;
pub use memory::{memory_transport, MemoryServer, MemorySession, MemoryTransport};
pub use transport::{FetchTransport, ResponseStream, StreamTransport};
