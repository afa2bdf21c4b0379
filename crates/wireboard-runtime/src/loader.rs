use std::path::Path;

use futures::future::BoxFuture;
use tracing::debug;

use wireboard_core::error::{Result, WireboardError};
use wireboard_core::traits::GraphLoader;
use wireboard_core::types::GraphDescriptor;

/// Loads JSON boards from local paths, `file://` URLs and `http(s)://` URLs.
#[derive(Debug, Clone, Default)]
pub struct DefaultGraphLoader {
    client: reqwest::Client,
}

impl DefaultGraphLoader {
    pub fn new() -> Self {
        Self::default()
    }

    async fn fetch(&self, url: &str) -> Result<String> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| WireboardError::GraphLoad(format!("{}: {}", url, e)))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(WireboardError::GraphLoad(format!(
                "{}: HTTP {}",
                url,
                status.as_u16()
            )));
        }
        resp.text()
            .await
            .map_err(|e| WireboardError::GraphLoad(format!("{}: {}", url, e)))
    }

    async fn read(&self, path: &Path) -> Result<String> {
        tokio::fs::read_to_string(path)
            .await
            .map_err(|e| WireboardError::GraphLoad(format!("{}: {}", path.display(), e)))
    }

    async fn load_graph(&self, url: &str) -> Result<GraphDescriptor> {
        debug!(url = %url, "Loading board");
        let text = if url.starts_with("http://") || url.starts_with("https://") {
            self.fetch(url).await?
        } else {
            let path = url.strip_prefix("file://").unwrap_or(url);
            self.read(Path::new(path)).await?
        };
        let mut graph = GraphDescriptor::from_json(&text)
            .map_err(|e| WireboardError::GraphLoad(format!("{}: {}", url, e)))?;
        graph.validate()?;
        if graph.url.is_none() {
            graph.url = Some(url.to_string());
        }
        Ok(graph)
    }
}

impl GraphLoader for DefaultGraphLoader {
    fn load(&self, url: &str) -> BoxFuture<'_, Result<GraphDescriptor>> {
        let url = url.to_string();
        Box::pin(async move { self.load_graph(&url).await })
    }
}
