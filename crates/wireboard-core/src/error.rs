use thiserror::Error;

/// Boxed cause carried by [`WireboardError::HandlerInvocation`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum WireboardError {
    // Kit errors
    #[error("No handler for node type \"{0}\"")]
    NoHandler(String),

    // Handler errors
    #[error("{0}")]
    Handler(String),

    #[error("{}", unwind_invocation(node, node_type, &**source))]
    HandlerInvocation {
        node: String,
        node_type: String,
        #[source]
        source: BoxError,
    },

    #[error("Handler timeout after {timeout_secs}s: {node}")]
    HandlerTimeout { node: String, timeout_secs: u64 },

    // Suspension errors
    #[error("Input was not supplied for node: {0}")]
    InputNotSupplied(String),

    #[error("Secret could not be resolved: {0}")]
    MissingSecret(String),

    // Traversal errors
    #[error("Nodes never received their required inputs: {}", nodes.join(", "))]
    UnsatisfiedInputs { nodes: Vec<String> },

    #[error("Run exceeded the firing limit ({0})")]
    FiringLimitExceeded(usize),

    #[error("Run cancelled")]
    Cancelled,

    // Proxy errors
    #[error("Proxy transport failed: {0}")]
    ProxyTransport(String),

    #[error("Proxy request rejected: {0}")]
    ProxyRejected(String),

    // Graph errors
    #[error("Failed to load graph: {0}")]
    GraphLoad(String),

    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, WireboardError>;

impl WireboardError {
    /// Wrap an error raised while invoking the handler of `node`.
    pub fn invocation(
        node: impl Into<String>,
        node_type: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self::HandlerInvocation {
            node: node.into(),
            node_type: node_type.into(),
            source: source.into(),
        }
    }

    /// True for errors that end the whole run rather than a single branch.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::NoHandler(_)
                | Self::ProxyTransport(_)
                | Self::FiringLimitExceeded(_)
                | Self::UnsatisfiedInputs { .. }
                | Self::Cancelled
        )
    }
}

fn unwind_invocation(node: &str, node_type: &str, source: &(dyn std::error::Error + 'static)) -> String {
    format!(
        "Handler \"{}\" failed for node \"{}\": {}",
        node_type,
        node,
        error_chain(source)
    )
}

/// Render an error and every `source()` below it, one cause per line.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut current = err.source();
    while let Some(cause) = current {
        message.push_str("\n  caused by: ");
        message.push_str(&cause.to_string());
        current = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("socket closed")]
    struct Root;

    #[derive(Debug, Error)]
    #[error("request failed")]
    struct Middle(#[source] Root);

    #[test]
    fn invocation_unwinds_cause_chain() {
        let err = WireboardError::invocation("fetch-1", "fetch", Middle(Root));
        let text = err.to_string();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"fetch\""));
        assert!(lines[0].contains("fetch-1"));
        assert!(lines[0].ends_with("request failed"));
        assert_eq!(lines[1], "  caused by: socket closed");
    }

    #[test]
    fn nested_invocation_keeps_inner_message() {
        let inner = WireboardError::Handler("division by zero".into());
        let err = WireboardError::invocation("calc", "runJavascript", inner);
        assert!(err.to_string().ends_with("division by zero"));
    }

    #[test]
    fn fatal_classification() {
        assert!(WireboardError::NoHandler("foo".into()).is_fatal());
        assert!(WireboardError::ProxyTransport("refused".into()).is_fatal());
        assert!(!WireboardError::MissingSecret("KEY".into()).is_fatal());
        assert!(!WireboardError::Handler("boom".into()).is_fatal());
        assert!(WireboardError::Cancelled.is_fatal());
    }

    #[test]
    fn unsatisfied_lists_nodes() {
        let err = WireboardError::UnsatisfiedInputs {
            nodes: vec!["a".into(), "b".into()],
        };
        assert_eq!(
            err.to_string(),
            "Nodes never received their required inputs: a, b"
        );
    }
}
