use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use wireboard_core::error::{Result, WireboardError};
use wireboard_core::traits::{NodeDescription, NodeHandler, NodeHandlerContext};
use wireboard_core::types::{InputValues, OutputValues};

/// HTTP request node. Usually proxied, since its headers carry credentials.
pub struct FetchHandler;

#[derive(Debug, Deserialize)]
struct FetchInput {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    headers: serde_json::Map<String, Value>,
    #[serde(default)]
    body: Option<Value>,
    /// Return the body as text instead of parsing JSON.
    #[serde(default)]
    raw: bool,
}

fn default_method() -> String {
    "GET".to_string()
}

fn fetch_error(message: impl Into<String>) -> WireboardError {
    WireboardError::Handler(message.into())
}

impl NodeHandler for FetchHandler {
    fn invoke(
        &self,
        inputs: InputValues,
        _ctx: NodeHandlerContext,
    ) -> BoxFuture<'_, Result<OutputValues>> {
        Box::pin(async move {
            let params: FetchInput = serde_json::from_value(Value::Object(inputs))
                .map_err(|e| fetch_error(format!("Invalid fetch inputs: {}", e)))?;

            let method = reqwest::Method::from_bytes(params.method.to_uppercase().as_bytes())
                .map_err(|_| fetch_error(format!("Unsupported method: {}", params.method)))?;

            debug!(url = %params.url, method = %method, "Fetching");

            let client = reqwest::Client::builder()
                .user_agent(concat!("Wireboard/", env!("CARGO_PKG_VERSION")))
                .build()
                .map_err(|e| fetch_error(format!("Failed to create HTTP client: {}", e)))?;

            let mut request = client.request(method, &params.url);
            for (name, value) in &params.headers {
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                request = request.header(name.as_str(), value);
            }
            if let Some(body) = &params.body {
                request = match body {
                    Value::String(s) => request.body(s.clone()),
                    other => request.json(other),
                };
            }

            let resp = request
                .send()
                .await
                .map_err(|e| fetch_error(format!("Request failed: {}", e)))?;

            let status = resp.status();
            if !status.is_success() {
                return Err(fetch_error(format!(
                    "HTTP {} {}",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or("Unknown")
                )));
            }

            let text = resp
                .text()
                .await
                .map_err(|e| fetch_error(format!("Failed to read response body: {}", e)))?;

            let response = if params.raw {
                Value::String(text)
            } else {
                serde_json::from_str(&text).unwrap_or(Value::String(text))
            };

            let mut out = OutputValues::new();
            out.insert("response".into(), response);
            out.insert("status".into(), Value::from(status.as_u16()));
            Ok(out)
        })
    }

    fn describe(&self, _inputs: Option<&InputValues>) -> BoxFuture<'_, Result<NodeDescription>> {
        Box::pin(async {
            Ok(NodeDescription {
                input_schema: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "url": { "type": "string", "title": "URL" },
                        "method": { "type": "string", "title": "Method", "default": "GET" },
                        "headers": { "type": "object", "title": "Headers" },
                        "body": { "title": "Body" },
                        "raw": { "type": "boolean", "title": "Raw", "default": false }
                    },
                    "required": ["url"]
                }),
                output_schema: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "response": { "title": "Response" },
                        "status": { "type": "integer", "title": "Status" }
                    }
                }),
            })
        })
    }

    fn timeout_secs(&self) -> Option<u64> {
        Some(60)
    }
}
