//! Transport seams of the discovery client.
//!
//! The client never touches sockets itself: a `StreamTransport` turns a queue
//! of outgoing requests into a stream of responses, and a `FetchTransport`
//! performs one request/response exchange. gRPC, HTTP and in-memory
//! implementations live next to this module.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use tokio::sync::mpsc;

use npds_core::error::Result;
use npds_core::proto::{DiscoveryRequest, DiscoveryResponse};

/// Responses of one open stream. Ends with `None` on orderly server close.
pub type ResponseStream = BoxStream<'static, Result<DiscoveryResponse>>;

#[async_trait]
pub trait StreamTransport: Send + Sync + 'static {
    /// Open a stream fed by `requests`. Dropping the sender side ends the
    /// request half of the stream.
    async fn open(&self, requests: mpsc::Receiver<DiscoveryRequest>) -> Result<ResponseStream>;
}

#[async_trait]
pub trait FetchTransport: Send + Sync + 'static {
    async fn fetch(&self, request: DiscoveryRequest) -> Result<DiscoveryResponse>;
}
