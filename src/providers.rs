use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};

/// Upstream dialect family. Drives transformer selection, header overlays,
/// and the session-id quirks of the iflow family.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DialectFamily {
    #[default]
    Openai,
    Anthropic,
    Gemini,
    Iflow,
}

impl DialectFamily {
    pub fn is_iflow(self) -> bool {
        matches!(self, DialectFamily::Iflow)
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    #[serde(default)]
    pub kind: DialectFamily,
    pub base_url: String,
    #[serde(default)]
    pub api_keys: Vec<String>,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub transformer: TransformerSpec,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signer: Option<SignerSpec>,
}

fn default_enabled() -> bool {
    true
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("base_url", &self.base_url)
            .field("api_keys", &"<redacted>")
            .field("models", &self.models)
            .field("enabled", &self.enabled)
            .finish()
    }
}

/// Ordered transformer names: provider-level chain plus model-specific tails.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TransformerSpec {
    #[serde(default, rename = "use")]
    pub chain: Vec<String>,
    #[serde(default)]
    pub per_model: BTreeMap<String, Vec<String>>,
}

/// HMAC-SHA256 signing recipe for families that require signed requests.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignerSpec {
    pub fields: Vec<String>,
    pub signature_header: String,
    pub timestamp_header: String,
}

struct ProviderEntry {
    config: ProviderConfig,
    key_cursor: usize,
}

/// Process-wide provider table. Key rotation is a round-robin
/// read-modify-write under the registry lock.
pub struct ProviderRegistry {
    entries: Mutex<Vec<ProviderEntry>>,
}

impl ProviderRegistry {
    pub fn new(providers: Vec<ProviderConfig>) -> Self {
        Self {
            entries: Mutex::new(
                providers
                    .into_iter()
                    .map(|config| ProviderEntry {
                        config,
                        key_cursor: 0,
                    })
                    .collect(),
            ),
        }
    }

    pub fn list(&self) -> Vec<ProviderConfig> {
        let entries = self.entries.lock().expect("provider registry poisoned");
        entries.iter().map(|entry| entry.config.clone()).collect()
    }

    pub fn get(&self, name: &str) -> Result<ProviderConfig> {
        let entries = self.entries.lock().expect("provider registry poisoned");
        entries
            .iter()
            .find(|entry| entry.config.name == name)
            .map(|entry| entry.config.clone())
            .ok_or_else(|| RelayError::ProviderNotFound {
                name: name.to_string(),
            })
    }

    /// Insert or replace by name. Returns true when an existing entry was
    /// replaced. The key cursor resets so rotation starts from the new list.
    pub fn upsert(&self, config: ProviderConfig) -> bool {
        let mut entries = self.entries.lock().expect("provider registry poisoned");
        if let Some(entry) = entries
            .iter_mut()
            .find(|entry| entry.config.name == config.name)
        {
            entry.config = config;
            entry.key_cursor = 0;
            return true;
        }
        entries.push(ProviderEntry {
            config,
            key_cursor: 0,
        });
        false
    }

    pub fn remove(&self, name: &str) -> bool {
        let mut entries = self.entries.lock().expect("provider registry poisoned");
        let before = entries.len();
        entries.retain(|entry| entry.config.name != name);
        entries.len() != before
    }

    pub fn toggle(&self, name: &str) -> Result<bool> {
        let mut entries = self.entries.lock().expect("provider registry poisoned");
        let entry = entries
            .iter_mut()
            .find(|entry| entry.config.name == name)
            .ok_or_else(|| RelayError::ProviderNotFound {
                name: name.to_string(),
            })?;
        entry.config.enabled = !entry.config.enabled;
        Ok(entry.config.enabled)
    }

    /// Next API key for the provider, rotating round-robin.
    pub fn next_api_key(&self, name: &str) -> Result<String> {
        let mut entries = self.entries.lock().expect("provider registry poisoned");
        let entry = entries
            .iter_mut()
            .find(|entry| entry.config.name == name)
            .ok_or_else(|| RelayError::ProviderNotFound {
                name: name.to_string(),
            })?;
        if entry.config.api_keys.is_empty() {
            return Ok(String::new());
        }
        let key = entry.config.api_keys[entry.key_cursor % entry.config.api_keys.len()].clone();
        entry.key_cursor = (entry.key_cursor + 1) % entry.config.api_keys.len();
        Ok(key)
    }

    /// All models across enabled providers, as `(provider, model)` pairs.
    pub fn all_models(&self) -> Vec<(String, String)> {
        let entries = self.entries.lock().expect("provider registry poisoned");
        entries
            .iter()
            .filter(|entry| entry.config.enabled)
            .flat_map(|entry| {
                entry
                    .config
                    .models
                    .iter()
                    .map(|model| (entry.config.name.clone(), model.clone()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(name: &str, keys: &[&str]) -> ProviderConfig {
        ProviderConfig {
            name: name.to_string(),
            kind: DialectFamily::Openai,
            base_url: "https://api.example.com/v1".to_string(),
            api_keys: keys.iter().map(|key| key.to_string()).collect(),
            models: vec!["m1".to_string()],
            headers: BTreeMap::new(),
            transformer: TransformerSpec::default(),
            enabled: true,
            signer: None,
        }
    }

    #[test]
    fn api_keys_rotate_round_robin() {
        let registry = ProviderRegistry::new(vec![provider("p", &["k1", "k2", "k3"])]);
        let keys: Vec<String> = (0..4).map(|_| registry.next_api_key("p").unwrap()).collect();
        assert_eq!(keys, vec!["k1", "k2", "k3", "k1"]);
    }

    #[test]
    fn upsert_replaces_and_resets_rotation() {
        let registry = ProviderRegistry::new(vec![provider("p", &["k1", "k2"])]);
        registry.next_api_key("p").unwrap();
        assert!(registry.upsert(provider("p", &["n1", "n2"])));
        assert_eq!(registry.next_api_key("p").unwrap(), "n1");
    }

    #[test]
    fn toggle_flips_enabled_and_hides_models() {
        let registry = ProviderRegistry::new(vec![provider("p", &[])]);
        assert_eq!(registry.all_models().len(), 1);
        assert!(!registry.toggle("p").unwrap());
        assert!(registry.all_models().is_empty());
    }

    #[test]
    fn missing_provider_is_an_error() {
        let registry = ProviderRegistry::new(Vec::new());
        assert!(matches!(
            registry.get("nope"),
            Err(RelayError::ProviderNotFound { .. })
        ));
    }

    #[test]
    fn debug_redacts_api_keys() {
        let rendered = format!("{:?}", provider("p", &["secret"]));
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("<redacted>"));
    }
}
