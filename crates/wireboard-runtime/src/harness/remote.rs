use std::time::Duration;

use futures::future::BoxFuture;
use tracing::debug;

use wireboard_core::error::{Result, WireboardError};
use wireboard_core::protocol::{ProxyErrorPayload, ProxyRequest, ProxyResponse, SESSION_HEADER};

use crate::proxy::ProxyEndpoint;

/// Client for a remote proxy server.
///
/// Every request carries the session header so the server keeps one secret
/// keeper per harness run.
pub struct RemoteProxyClient {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
    session: String,
}

impl RemoteProxyClient {
    pub fn new(
        url: impl Into<String>,
        token: Option<String>,
        session: impl Into<String>,
        timeout_secs: u64,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(concat!("Wireboard/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| WireboardError::ProxyTransport(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
            token,
            session: session.into(),
        })
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    async fn post(&self, request: ProxyRequest) -> Result<ProxyResponse> {
        debug!(url = %self.url, node_id = %request.node.id, "Sending proxy request");
        let mut builder = self
            .client
            .post(&self.url)
            .header(SESSION_HEADER, &self.session)
            .json(&request);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| WireboardError::ProxyTransport(e.to_string()))?;

        let status = resp.status();
        let body = resp
            .bytes()
            .await
            .map_err(|e| WireboardError::ProxyTransport(e.to_string()))?;

        if status.is_success() {
            return serde_json::from_slice::<ProxyResponse>(&body).map_err(|e| {
                WireboardError::ProxyTransport(format!("Malformed proxy response: {}", e))
            });
        }

        match serde_json::from_slice::<ProxyErrorPayload>(&body) {
            Ok(payload) => Err(payload.into_error()),
            Err(_) => Err(WireboardError::ProxyTransport(format!(
                "HTTP {} {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("Unknown")
            ))),
        }
    }
}

impl ProxyEndpoint for RemoteProxyClient {
    fn handle(&self, request: ProxyRequest) -> BoxFuture<'_, Result<ProxyResponse>> {
        Box::pin(self.post(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wireboard_core::types::NodeDescriptor;

    #[tokio::test]
    async fn unreachable_server_is_transport_error() {
        // Port 9 (discard) on loopback is almost never listening.
        let client = RemoteProxyClient::new("http://127.0.0.1:9/proxy", None, "s-1", 2).unwrap();
        let err = client
            .handle(ProxyRequest {
                node: NodeDescriptor::new("f", "fetch"),
                inputs: Default::default(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, WireboardError::ProxyTransport(_)));
        assert!(err.is_fatal());
    }
}
