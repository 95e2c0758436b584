//! HTTP mapping of the unary fetch: `POST` the protobuf-encoded request to
//! the discovery path, decode the protobuf response body.

use async_trait::async_trait;
use bytes::Bytes;
use prost::Message;

use npds_core::error::{NpdsError, Result};
use npds_core::proto::{DiscoveryRequest, DiscoveryResponse, HTTP_DISCOVERY_PATH};

use super::transport::FetchTransport;

const PROTOBUF_CONTENT_TYPE: &str = "application/x-protobuf";

#[derive(Debug, Clone)]
pub struct HttpFetchTransport {
    client: reqwest::Client,
    url: String,
}

impl HttpFetchTransport {
    pub fn new(base: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| NpdsError::Internal(format!("http client: {e}")))?;
        Ok(Self {
            client,
            url: format!("{}{}", base.trim_end_matches('/'), HTTP_DISCOVERY_PATH),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl FetchTransport for HttpFetchTransport {
    async fn fetch(&self, request: DiscoveryRequest) -> Result<DiscoveryResponse> {
        let resp = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, PROTOBUF_CONTENT_TYPE)
            .header(reqwest::header::ACCEPT, PROTOBUF_CONTENT_TYPE)
            .body(request.encode_to_vec())
            .send()
            .await
            .map_err(|e| NpdsError::StreamTransport(format!("POST {} failed: {e}", self.url)))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(NpdsError::StreamTransport(format!(
                "POST {} returned {status}",
                self.url
            )));
        }

        let body: Bytes = resp
            .bytes()
            .await
            .map_err(|e| NpdsError::StreamTransport(format!("read body failed: {e}")))?;
        DiscoveryResponse::decode(body)
            .map_err(|e| NpdsError::StreamTransport(format!("decode response failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_joins_discovery_path() {
        let t = HttpFetchTransport::new("http://cp.local:9900/").unwrap();
        assert_eq!(t.url(), "http://cp.local:9900/v2/discovery:network_policies");
    }
}
