//! Remote-proxy wire protocol: one JSON request, one JSON reply.

use serde::{Deserialize, Serialize};

use crate::error::WireboardError;
use crate::types::*;

/// Header scoping server-side secret state to one harness session.
pub const SESSION_HEADER: &str = "x-wireboard-session";

/// Body of `POST /proxy`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyRequest {
    pub node: NodeDescriptor,
    #[serde(default)]
    pub inputs: InputValues,
}

/// Successful reply to a proxy request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyResponse {
    pub node_type: String,
    pub value: OutputValues,
}

/// Error reply to a proxy request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyErrorPayload {
    pub error: ProxyErrorDetail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyErrorDetail {
    /// Machine-readable category: `rejected`, `missing_secret`, `handler`.
    pub kind: String,
    pub message: String,
}

impl ProxyErrorPayload {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ProxyErrorDetail {
                kind: kind.into(),
                message: message.into(),
            },
        }
    }

    /// Classify an error raised on the trusted side.
    pub fn from_error(err: &WireboardError) -> Self {
        match err {
            WireboardError::ProxyRejected(message) => Self::new("rejected", message.clone()),
            WireboardError::MissingSecret(name) => Self::new("missing_secret", name.clone()),
            other => Self::new("handler", other.to_string()),
        }
    }

    /// Rebuild the error on the calling side.
    pub fn into_error(self) -> WireboardError {
        let ProxyErrorDetail { kind, message } = self.error;
        match kind.as_str() {
            "rejected" => WireboardError::ProxyRejected(message),
            "missing_secret" => WireboardError::MissingSecret(message),
            _ => WireboardError::Handler(message),
        }
    }
}
