//! gRPC transport (tonic) for the network policy discovery service.
//!
//! The client stub is written against `tonic::client::Grpc` with the prost
//! codec, exactly what codegen would emit for the two methods we call, so the
//! crate needs no protoc at build time.

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint};

use npds_core::error::{NpdsError, Result};
use npds_core::proto::{
    DiscoveryRequest, DiscoveryResponse, DISCOVERY_SERVICE, FETCH_NETWORK_POLICIES_PATH,
    STREAM_NETWORK_POLICIES_PATH,
};

use super::transport::{FetchTransport, ResponseStream, StreamTransport};

#[derive(Debug, Clone)]
pub struct NetworkPolicyDiscoveryClient {
    inner: tonic::client::Grpc<Channel>,
}

impl NetworkPolicyDiscoveryClient {
    pub fn new(channel: Channel) -> Self {
        Self {
            inner: tonic::client::Grpc::new(channel),
        }
    }

    async fn ready(&mut self) -> std::result::Result<(), tonic::Status> {
        self.inner
            .ready()
            .await
            .map_err(|e| tonic::Status::new(tonic::Code::Unknown, format!("service was not ready: {e}")))
    }

    pub async fn stream_network_policies(
        &mut self,
        request: impl tonic::IntoStreamingRequest<Message = DiscoveryRequest>,
    ) -> std::result::Result<tonic::Response<tonic::codec::Streaming<DiscoveryResponse>>, tonic::Status> {
        self.ready().await?;
        let codec = tonic::codec::ProstCodec::default();
        let path = PathAndQuery::from_static(STREAM_NETWORK_POLICIES_PATH);
        let mut req = request.into_streaming_request();
        req.extensions_mut()
            .insert(tonic::GrpcMethod::new(DISCOVERY_SERVICE, "StreamNetworkPolicies"));
        self.inner.streaming(req, path, codec).await
    }

    pub async fn fetch_network_policies(
        &mut self,
        request: impl tonic::IntoRequest<DiscoveryRequest>,
    ) -> std::result::Result<tonic::Response<DiscoveryResponse>, tonic::Status> {
        self.ready().await?;
        let codec = tonic::codec::ProstCodec::default();
        let path = PathAndQuery::from_static(FETCH_NETWORK_POLICIES_PATH);
        let mut req = request.into_request();
        req.extensions_mut()
            .insert(tonic::GrpcMethod::new(DISCOVERY_SERVICE, "FetchNetworkPolicies"));
        self.inner.unary(req, path, codec).await
    }
}

fn status_err(s: tonic::Status) -> NpdsError {
    NpdsError::StreamTransport(format!("{:?}: {}", s.code(), s.message()))
}

/// Connects lazily on every `open`/`fetch`; a failed connect surfaces as a
/// `StreamTransport` error and goes through the client's backoff.
#[derive(Debug, Clone)]
pub struct GrpcTransport {
    endpoint: Endpoint,
}

impl GrpcTransport {
    pub fn new(endpoint: &str) -> Result<Self> {
        let endpoint = Endpoint::from_shared(endpoint.to_string())
            .map_err(|e| NpdsError::BadConfig(format!("invalid discovery endpoint {endpoint}: {e}")))?;
        Ok(Self { endpoint })
    }

    async fn client(&self) -> Result<NetworkPolicyDiscoveryClient> {
        let channel = self
            .endpoint
            .connect()
            .await
            .map_err(|e| NpdsError::StreamTransport(format!("connect failed: {e}")))?;
        Ok(NetworkPolicyDiscoveryClient::new(channel))
    }
}

#[async_trait]
impl StreamTransport for GrpcTransport {
    async fn open(&self, requests: mpsc::Receiver<DiscoveryRequest>) -> Result<ResponseStream> {
        let mut client = self.client().await?;
        let inbound = client
            .stream_network_policies(ReceiverStream::new(requests))
            .await
            .map_err(status_err)?
            .into_inner();
        Ok(inbound.map(|r| r.map_err(status_err)).boxed())
    }
}

#[async_trait]
impl FetchTransport for GrpcTransport {
    async fn fetch(&self, request: DiscoveryRequest) -> Result<DiscoveryResponse> {
        let mut client = self.client().await?;
        let resp = client
            .fetch_network_policies(request)
            .await
            .map_err(status_err)?;
        Ok(resp.into_inner())
    }
}
