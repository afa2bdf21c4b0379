use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

use crate::error::{Result, WireboardError};

/// Top-level Wireboard configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub harness: HarnessConfig,
    #[serde(default)]
    pub server: Option<ServerConfig>,
}

/// What to do with nodes still waiting on required inputs when nothing
/// else can fire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrandedPolicy {
    /// Log each stranded node and finish with `end`.
    #[default]
    End,
    /// Finish with an `error` naming the stranded nodes.
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Emit graphstart/nodestart/nodeend/graphend to the caller.
    #[serde(default)]
    pub diagnostics: bool,
    /// Upper bound on concurrently pending invocations.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Loop guard: maximum node firings per run.
    #[serde(default = "default_max_firings")]
    pub max_firings: usize,
    #[serde(default = "default_node_timeout")]
    pub node_timeout_secs: u64,
    #[serde(default)]
    pub stranded: StrandedPolicy,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            diagnostics: false,
            max_concurrency: default_max_concurrency(),
            max_firings: default_max_firings(),
            node_timeout_secs: default_node_timeout(),
            stranded: StrandedPolicy::default(),
        }
    }
}

impl RunConfig {
    /// Concurrency limit, never below one.
    pub fn concurrency(&self) -> usize {
        self.max_concurrency.max(1)
    }
}

fn default_max_concurrency() -> usize {
    8
}

fn default_max_firings() -> usize {
    10_000
}

fn default_node_timeout() -> u64 {
    300
}

/// Where the traversal engine runs relative to privileged handlers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topology {
    #[default]
    InProcess,
    Worker,
    Remote,
}

impl std::fmt::Display for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InProcess => write!(f, "in-process"),
            Self::Worker => write!(f, "worker"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

impl std::str::FromStr for Topology {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "in-process" | "local" | "main" => Ok(Self::InProcess),
            "worker" => Ok(Self::Worker),
            "remote" | "http" => Ok(Self::Remote),
            other => Err(format!("unknown topology: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessConfig {
    #[serde(default)]
    pub topology: Topology,
    /// Node types executed on the trusted side.
    #[serde(default)]
    pub proxy_nodes: Vec<String>,
    /// Proxy endpoint for the remote topology.
    #[serde(default)]
    pub remote_url: Option<String>,
    #[serde(default)]
    pub remote_token: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Destinations each secret may be revealed to, worker topology only.
    #[serde(default)]
    pub tunnels: HashMap<String, TunnelConfig>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            topology: Topology::default(),
            proxy_nodes: vec![],
            remote_url: None,
            remote_token: None,
            request_timeout_secs: default_request_timeout(),
            tunnels: HashMap::new(),
        }
    }
}

fn default_request_timeout() -> u64 {
    120
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Bearer token required on proxy requests; open when unset.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub proxy_nodes: Vec<String>,
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,
    /// Secret name to value, usually `${ENV_VAR}` references.
    #[serde(default)]
    pub secrets: HashMap<String, String>,
    /// Secret name to the destinations allowed to see its plaintext.
    #[serde(default)]
    pub tunnels: HashMap<String, TunnelConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            token: None,
            proxy_nodes: vec![],
            session_ttl_secs: default_session_ttl(),
            secrets: HashMap::new(),
            tunnels: HashMap::new(),
        }
    }
}

/// Where one secret may be revealed.
///
/// `to` names the node types that receive plaintext; `when` maps input names
/// to regexes that the request's inputs must all match. Any other
/// destination sees a blocked placeholder instead.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TunnelConfig {
    #[serde(deserialize_with = "one_or_many")]
    pub to: Vec<String>,
    #[serde(default)]
    pub when: BTreeMap<String, String>,
}

fn one_or_many<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    Ok(match OneOrMany::deserialize(d)? {
        OneOrMany::One(node_type) => vec![node_type],
        OneOrMany::Many(node_types) => node_types,
    })
}

fn default_bind() -> String {
    "127.0.0.1:7474".to_string()
}

fn default_session_ttl() -> u64 {
    3600
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Loading config");
        let content = std::fs::read_to_string(path)
            .map_err(|_| WireboardError::ConfigNotFound(path.display().to_string()))?;
        Self::parse(&content)
    }

    /// Parse config text, expanding `${ENV_VAR}` references first.
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        toml::from_str(&expanded).map_err(|e| WireboardError::Config(e.to_string()))
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Leave the reference verbatim when unset
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_WIREBOARD_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_WIREBOARD_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_WIREBOARD_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_WIREBOARD_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_WIREBOARD_VAR}\"");
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = AppConfig::parse("").unwrap();
        assert!(!config.run.diagnostics);
        assert_eq!(config.run.max_concurrency, 8);
        assert_eq!(config.run.max_firings, 10_000);
        assert_eq!(config.run.stranded, StrandedPolicy::End);
        assert_eq!(config.harness.topology, Topology::InProcess);
        assert!(config.harness.proxy_nodes.is_empty());
        assert!(config.server.is_none());
    }

    #[test]
    fn test_concurrency_floor() {
        let config = AppConfig::parse("[run]\nmax_concurrency = 0\n").unwrap();
        assert_eq!(config.run.concurrency(), 1);
    }

    #[test]
    fn test_topology_names() {
        let config = AppConfig::parse("[harness]\ntopology = \"worker\"\n").unwrap();
        assert_eq!(config.harness.topology, Topology::Worker);
        assert_eq!("http".parse::<Topology>().unwrap(), Topology::Remote);
        assert!("carrier-pigeon".parse::<Topology>().is_err());
        assert_eq!(Topology::InProcess.to_string(), "in-process");
    }

    #[test]
    fn test_server_section() {
        let toml_str = r#"
[server]
bind = "0.0.0.0:9000"
proxy_nodes = ["fetch", "secrets"]

[server.secrets]
PALM_KEY = "abc"
"#;
        let config = AppConfig::parse(toml_str).unwrap();
        let server = config.server.unwrap();
        assert_eq!(server.bind, "0.0.0.0:9000");
        assert_eq!(server.proxy_nodes, vec!["fetch", "secrets"]);
        assert_eq!(server.secrets.get("PALM_KEY").map(String::as_str), Some("abc"));
        assert_eq!(server.session_ttl_secs, 3600);
        assert!(server.token.is_none());
    }

    #[test]
    fn test_server_tunnels() {
        let toml_str = r#"
[server.tunnels]
API_KEY = { to = "fetch", when = { url = "^https://api\\." } }
DB_PASS = { to = ["query", "migrate"] }
"#;
        let server = AppConfig::parse(toml_str).unwrap().server.unwrap();
        let api = &server.tunnels["API_KEY"];
        assert_eq!(api.to, vec!["fetch"]);
        assert_eq!(api.when.get("url").map(String::as_str), Some("^https://api\\."));
        let db = &server.tunnels["DB_PASS"];
        assert_eq!(db.to, vec!["query", "migrate"]);
        assert!(db.when.is_empty());
        assert!(AppConfig::parse("[server.tunnels]\nK = { when = {} }\n").is_err());
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = AppConfig::parse("[run\n").unwrap_err();
        assert!(matches!(err, WireboardError::Config(_)));
    }
}
