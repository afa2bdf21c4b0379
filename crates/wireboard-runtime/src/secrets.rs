use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use wireboard_core::error::{Result, WireboardError};

const TOKEN_PREFIX: &str = "WIREBOARD_SECRET_";

/// Secrets shorter than this are concealed only where a whole string equals
/// them; substring replacement would mangle unrelated text.
const MIN_CONCEAL_LEN: usize = 4;

fn token_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"WIREBOARD_SECRET_[0-9a-f]{32}").expect("token regex"))
}

#[derive(Debug, Clone)]
struct SecretEntry {
    name: String,
    value: Option<String>,
}

/// Per-session map between opaque tokens and secret values.
///
/// Lives only on the trusted side of a proxy boundary. Tokens travel through
/// the graph as ordinary strings; plaintext is substituted back in only
/// right before a proxied handler runs.
#[derive(Debug, Default)]
pub struct SecretKeeper {
    entries: Mutex<HashMap<String, SecretEntry>>,
}

impl SecretKeeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue one token per secret name, reusing tokens already issued.
    pub async fn add_secret_tokens(&self, names: &[String]) -> BTreeMap<String, String> {
        let mut entries = self.entries.lock().await;
        let mut issued = BTreeMap::new();
        for name in names {
            let existing = entries
                .iter()
                .find(|(_, entry)| &entry.name == name)
                .map(|(token, _)| token.clone());
            let token = match existing {
                Some(token) => token,
                None => {
                    let token = format!("{}{}", TOKEN_PREFIX, uuid::Uuid::new_v4().simple());
                    debug!(secret = %name, token = %token, "Issued secret token");
                    entries.insert(
                        token.clone(),
                        SecretEntry {
                            name: name.clone(),
                            value: None,
                        },
                    );
                    token
                }
            };
            issued.insert(name.clone(), token);
        }
        issued
    }

    /// Every token embedded anywhere in `value`, in discovery order.
    pub fn find_secrets(value: &Value) -> Vec<String> {
        let mut found = Vec::new();
        collect_tokens(value, &mut found);
        found
    }

    /// Secret name a token was issued for.
    pub async fn name_for(&self, token: &str) -> Option<String> {
        self.entries
            .lock()
            .await
            .get(token)
            .map(|entry| entry.name.clone())
    }

    /// Names behind `tokens` whose values are not yet known.
    ///
    /// Fails with `MissingSecret` on a token this keeper never issued.
    pub async fn unresolved(&self, tokens: &[String]) -> Result<Vec<String>> {
        let entries = self.entries.lock().await;
        let mut names = Vec::new();
        for token in tokens {
            let entry = entries
                .get(token)
                .ok_or_else(|| WireboardError::MissingSecret(token.clone()))?;
            if entry.value.is_none() && !names.contains(&entry.name) {
                names.push(entry.name.clone());
            }
        }
        Ok(names)
    }

    /// Record the value of secret `name`. Returns false if no token was
    /// issued for it.
    pub async fn resolve(&self, name: &str, value: impl Into<String>) -> bool {
        let value = value.into();
        let mut entries = self.entries.lock().await;
        let mut known = false;
        for entry in entries.values_mut().filter(|e| e.name == name) {
            entry.value = Some(value.clone());
            known = true;
        }
        known
    }

    /// Replace each of `tokens` inside `value` with its plaintext.
    pub async fn reveal_secrets(&self, value: Value, tokens: &[String]) -> Result<Value> {
        let entries = self.entries.lock().await;
        let mut plaintext: Vec<(&str, &str)> = Vec::with_capacity(tokens.len());
        for token in tokens {
            let entry = entries
                .get(token)
                .ok_or_else(|| WireboardError::MissingSecret(token.clone()))?;
            let secret = entry
                .value
                .as_deref()
                .ok_or_else(|| WireboardError::MissingSecret(entry.name.clone()))?;
            plaintext.push((token.as_str(), secret));
        }
        Ok(map_strings(value, &|s| {
            let mut out = s.to_string();
            for (token, secret) in &plaintext {
                if out.contains(token) {
                    out = out.replace(token, secret);
                }
            }
            out
        }))
    }

    /// Replace each of `tokens` inside `value` with `placeholder`.
    pub fn block(value: Value, tokens: &[String], placeholder: &str) -> Value {
        if tokens.is_empty() {
            return value;
        }
        map_strings(value, &|s| {
            let mut out = s.to_string();
            for token in tokens {
                if out.contains(token.as_str()) {
                    out = out.replace(token.as_str(), placeholder);
                }
            }
            out
        })
    }

    /// Replace every known plaintext inside `value` with its token.
    pub async fn conceal(&self, value: Value) -> Value {
        let entries = self.entries.lock().await;
        let mut known: Vec<(&str, &str)> = entries
            .iter()
            .filter_map(|(token, entry)| {
                entry
                    .value
                    .as_deref()
                    .filter(|v| !v.is_empty())
                    .map(|v| (v, token.as_str()))
            })
            .collect();
        if known.is_empty() {
            return value;
        }
        // Longest first so a secret that contains another is replaced whole.
        known.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        map_strings(value, &|s| {
            if let Some((_, token)) = known.iter().find(|(secret, _)| *secret == s) {
                return token.to_string();
            }
            let mut out = s.to_string();
            for (secret, token) in known.iter().filter(|(v, _)| v.len() >= MIN_CONCEAL_LEN) {
                if out.contains(secret) {
                    out = out.replace(secret, token);
                }
            }
            out
        })
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

fn collect_tokens(value: &Value, found: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            for m in token_pattern().find_iter(s) {
                if !found.iter().any(|t| t == m.as_str()) {
                    found.push(m.as_str().to_string());
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_tokens(v, found)),
        Value::Object(map) => map.values().for_each(|v| collect_tokens(v, found)),
        _ => {}
    }
}

fn map_strings(value: Value, f: &dyn Fn(&str) -> String) -> Value {
    match value {
        Value::String(s) => Value::String(f(&s)),
        Value::Array(items) => Value::Array(items.into_iter().map(|v| map_strings(v, f)).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, map_strings(v, f)))
                .collect(),
        ),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn tokens_are_opaque_and_stable() {
        let keeper = SecretKeeper::new();
        let first = keeper.add_secret_tokens(&names(&["API_KEY"])).await;
        let second = keeper.add_secret_tokens(&names(&["API_KEY", "OTHER"])).await;
        assert_eq!(first["API_KEY"], second["API_KEY"]);
        assert_ne!(second["API_KEY"], second["OTHER"]);
        assert!(first["API_KEY"].starts_with(TOKEN_PREFIX));
        assert!(!first["API_KEY"].contains("API_KEY"));
        assert_eq!(keeper.len().await, 2);
    }

    #[tokio::test]
    async fn find_and_reveal_leaves_no_token_behind() {
        let keeper = SecretKeeper::new();
        let tokens = keeper.add_secret_tokens(&names(&["A", "B"])).await;
        let (ta, tb) = (tokens["A"].clone(), tokens["B"].clone());

        let value = json!({
            "headers": { "Authorization": format!("Bearer {}", ta) },
            "list": [1, { "deep": [tb.clone()] }],
            "again": format!("{}-{}", ta, tb),
        });

        let found = SecretKeeper::find_secrets(&value);
        assert_eq!(found.len(), 2);
        assert!(found.contains(&ta) && found.contains(&tb));
        for token in &found {
            let name = keeper.name_for(token).await.unwrap();
            assert_eq!(tokens[&name], *token);
        }

        assert_eq!(keeper.unresolved(&found).await.unwrap().len(), 2);
        assert!(keeper.resolve("A", "alpha").await);
        assert!(keeper.resolve("B", "beta").await);
        assert!(keeper.unresolved(&found).await.unwrap().is_empty());

        let revealed = keeper.reveal_secrets(value, &found).await.unwrap();
        let text = revealed.to_string();
        assert!(!text.contains(TOKEN_PREFIX));
        assert_eq!(revealed["headers"]["Authorization"], "Bearer alpha");
        assert_eq!(revealed["list"][1]["deep"][0], "beta");
        assert_eq!(revealed["again"], "alpha-beta");
    }

    #[tokio::test]
    async fn reveal_unresolved_is_missing_secret() {
        let keeper = SecretKeeper::new();
        let tokens = keeper.add_secret_tokens(&names(&["KEY"])).await;
        let token = tokens["KEY"].clone();
        let err = keeper
            .reveal_secrets(json!(token.clone()), &[token])
            .await
            .unwrap_err();
        assert!(matches!(err, WireboardError::MissingSecret(n) if n == "KEY"));
    }

    #[tokio::test]
    async fn foreign_token_is_rejected() {
        let keeper = SecretKeeper::new();
        let foreign = format!("{}{}", TOKEN_PREFIX, "0".repeat(32));
        assert!(keeper.unresolved(&[foreign]).await.is_err());
        assert!(!keeper.resolve("NEVER_ISSUED", "x").await);
    }

    #[tokio::test]
    async fn conceal_replaces_plaintext() {
        let keeper = SecretKeeper::new();
        let tokens = keeper.add_secret_tokens(&names(&["KEY"])).await;
        keeper.resolve("KEY", "hunter2").await;
        let out = keeper
            .conceal(json!({ "echo": "sent hunter2 upstream", "n": 3 }))
            .await;
        assert_eq!(out["echo"], format!("sent {} upstream", tokens["KEY"]));
        assert_eq!(out["n"], 3);
    }

    #[tokio::test]
    async fn short_secret_is_concealed_only_as_a_whole_string() {
        let keeper = SecretKeeper::new();
        let tokens = keeper.add_secret_tokens(&names(&["PIN", "KEY"])).await;
        keeper.resolve("PIN", "a").await;
        keeper.resolve("KEY", "hunter2").await;
        let out = keeper
            .conceal(json!({ "fruit": "banana", "pin": "a", "list": ["a", "hunter2 said a"] }))
            .await;
        assert_eq!(out["fruit"], "banana");
        assert_eq!(out["pin"], tokens["PIN"].as_str());
        assert_eq!(out["list"][0], tokens["PIN"].as_str());
        assert_eq!(out["list"][1], format!("{} said a", tokens["KEY"]));
    }

    #[tokio::test]
    async fn keepers_do_not_share_state() {
        let a = SecretKeeper::new();
        let b = SecretKeeper::new();
        let tokens = a.add_secret_tokens(&names(&["KEY"])).await;
        assert!(b.name_for(&tokens["KEY"]).await.is_none());
    }
}
