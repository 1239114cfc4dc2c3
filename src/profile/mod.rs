//! Profile store - the declarative set of providers this gateway runs
//!
//! A profile is a `mcpServers` JSON document, byte-compatible with the
//! widely-deployed client configuration shape so raw config files import
//! without translation. Profiles are mutated only by `add`/`remove`/`import`
//! operations, never by request handling.

pub mod schema;
pub mod store;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{Error, Result};

pub use schema::{ConfigVariable, ConfigurationSchema};
pub use store::ProfileStore;

/// One provider entry in a profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSpec {
    /// Command to launch
    pub command: String,
    /// Ordered arguments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Environment variables; may contain secrets, never logged
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Where this entry came from, when imported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Provenance>,
}

/// Import provenance tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    /// Display name of the import source (e.g. an upstream client)
    pub source: String,
    /// When the import happened
    pub imported_at: DateTime<Utc>,
}

/// A named set of provider specs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Provider name to spec; names become FQTN prefixes
    #[serde(rename = "mcpServers", default)]
    mcp_servers: BTreeMap<String, ProviderSpec>,
}

impl Profile {
    /// Providers in the profile, in stable name order
    #[must_use]
    pub fn providers(&self) -> &BTreeMap<String, ProviderSpec> {
        &self.mcp_servers
    }

    /// Look up a provider spec by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ProviderSpec> {
        self.mcp_servers.get(name)
    }

    /// Whether the profile contains a provider
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.mcp_servers.contains_key(name)
    }

    /// Add a provider.
    ///
    /// # Errors
    ///
    /// Rejects duplicate names and names containing the FQTN separator.
    pub fn add(&mut self, name: String, spec: ProviderSpec) -> Result<()> {
        if name.is_empty() || name.contains(':') {
            return Err(Error::Config(format!("invalid provider name: {name:?}")));
        }
        if self.mcp_servers.contains_key(&name) {
            return Err(Error::Config(format!("provider already exists: {name}")));
        }
        self.mcp_servers.insert(name, spec);
        Ok(())
    }

    /// Remove a provider.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConfigured`] if the provider is absent.
    pub fn remove(&mut self, name: &str) -> Result<ProviderSpec> {
        self.mcp_servers
            .remove(name)
            .ok_or_else(|| Error::NotConfigured(name.to_string()))
    }

    /// Content hash of the profile.
    ///
    /// SHA-256 over the canonical JSON serialization. The map is ordered, so
    /// the hash is stable across load/save cycles and independent of
    /// insertion order.
    #[must_use]
    pub fn content_hash(&self) -> String {
        let canonical = serde_json::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn spec(command: &str) -> ProviderSpec {
        ProviderSpec {
            command: command.to_string(),
            args: vec![],
            env: BTreeMap::new(),
            provenance: None,
        }
    }

    #[test]
    fn add_then_remove_restores_hash() {
        let mut profile = Profile::default();
        profile.add("fs".into(), spec("mcp-fs")).unwrap();
        let before = profile.content_hash();

        profile.add("shell".into(), spec("bash-server")).unwrap();
        assert_ne!(profile.content_hash(), before);

        profile.remove("shell").unwrap();
        assert_eq!(profile.content_hash(), before);
    }

    #[test]
    fn add_rejects_duplicates_and_bad_names() {
        let mut profile = Profile::default();
        profile.add("fs".into(), spec("mcp-fs")).unwrap();
        assert!(profile.add("fs".into(), spec("other")).is_err());
        assert!(profile.add("a:b".into(), spec("x")).is_err());
        assert!(profile.add(String::new(), spec("x")).is_err());
    }

    #[test]
    fn remove_missing_is_not_configured() {
        let mut profile = Profile::default();
        let err = profile.remove("ghost").unwrap_err();
        assert_eq!(err.kind(), "not_configured");
    }

    #[test]
    fn hash_is_insertion_order_independent() {
        let mut a = Profile::default();
        a.add("one".into(), spec("cmd-1")).unwrap();
        a.add("two".into(), spec("cmd-2")).unwrap();

        let mut b = Profile::default();
        b.add("two".into(), spec("cmd-2")).unwrap();
        b.add("one".into(), spec("cmd-1")).unwrap();

        assert_eq!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn wire_shape_matches_client_config_format() {
        let raw = json!({
            "mcpServers": {
                "filesystem": {
                    "command": "npx",
                    "args": ["-y", "@modelcontextprotocol/server-filesystem", "/data"],
                    "env": {"LOG": "1"}
                }
            }
        });
        let profile: Profile = serde_json::from_value(raw).unwrap();
        let fs = profile.get("filesystem").unwrap();
        assert_eq!(fs.command, "npx");
        assert_eq!(fs.args.len(), 3);
        assert_eq!(fs.env.get("LOG").map(String::as_str), Some("1"));

        // Optional fields stay off the wire when absent
        let out = serde_json::to_value(&profile).unwrap();
        assert!(out["mcpServers"]["filesystem"].get("provenance").is_none());
    }
}
