//! In-process transport: a control plane reachable through channels.
//!
//! `memory_transport()` returns the client half (`MemoryTransport`) and the
//! server half (`MemoryServer`). Every `open` shows up on the server as a
//! `MemorySession` holding the client's request queue and a response sender;
//! dropping the session's sender closes the stream, sending an `Err` fails it.
//! Used to embed a control plane in-process and to drive the protocol in tests.

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;

use npds_core::error::{NpdsError, Result};
use npds_core::proto::{DiscoveryRequest, DiscoveryResponse};

use super::transport::{FetchTransport, ResponseStream, StreamTransport};

const RESPONSE_QUEUE_DEPTH: usize = 16;

pub struct MemorySession {
    pub requests: mpsc::Receiver<DiscoveryRequest>,
    pub responses: mpsc::Sender<Result<DiscoveryResponse>>,
}

impl MemorySession {
    /// Next request from the client; `None` once it closed its half.
    pub async fn recv(&mut self) -> Option<DiscoveryRequest> {
        self.requests.recv().await
    }

    /// Push a response; fails if the client already went away.
    pub async fn send(&self, resp: DiscoveryResponse) -> Result<()> {
        self.responses
            .send(Ok(resp))
            .await
            .map_err(|_| NpdsError::StreamTransport("client stream closed".into()))
    }

    /// Fail the stream with a transport error.
    pub async fn fail(self, reason: &str) {
        let _ = self
            .responses
            .send(Err(NpdsError::StreamTransport(reason.to_string())))
            .await;
    }
}

pub struct PendingFetch {
    pub request: DiscoveryRequest,
    pub reply: oneshot::Sender<Result<DiscoveryResponse>>,
}

pub struct MemoryServer {
    sessions: mpsc::UnboundedReceiver<MemorySession>,
    fetches: mpsc::UnboundedReceiver<PendingFetch>,
}

impl MemoryServer {
    pub async fn accept(&mut self) -> Option<MemorySession> {
        self.sessions.recv().await
    }

    pub async fn next_fetch(&mut self) -> Option<PendingFetch> {
        self.fetches.recv().await
    }
}

#[derive(Clone)]
pub struct MemoryTransport {
    sessions: mpsc::UnboundedSender<MemorySession>,
    fetches: mpsc::UnboundedSender<PendingFetch>,
}

pub fn memory_transport() -> (MemoryTransport, MemoryServer) {
    let (stx, srx) = mpsc::unbounded_channel();
    let (ftx, frx) = mpsc::unbounded_channel();
    (
        MemoryTransport {
            sessions: stx,
            fetches: ftx,
        },
        MemoryServer {
            sessions: srx,
            fetches: frx,
        },
    )
}

#[async_trait]
impl StreamTransport for MemoryTransport {
    async fn open(&self, requests: mpsc::Receiver<DiscoveryRequest>) -> Result<ResponseStream> {
        let (tx, rx) = mpsc::channel(RESPONSE_QUEUE_DEPTH);
        self.sessions
            .send(MemorySession { requests, responses: tx })
            .map_err(|_| NpdsError::StreamTransport("control plane unavailable".into()))?;
        Ok(ReceiverStream::new(rx).boxed())
    }
}

#[async_trait]
impl FetchTransport for MemoryTransport {
    async fn fetch(&self, request: DiscoveryRequest) -> Result<DiscoveryResponse> {
        let (reply, rx) = oneshot::channel();
        self.fetches
            .send(PendingFetch { request, reply })
            .map_err(|_| NpdsError::StreamTransport("control plane unavailable".into()))?;
        rx.await
            .map_err(|_| NpdsError::StreamTransport("fetch dropped by control plane".into()))?
    }
}
