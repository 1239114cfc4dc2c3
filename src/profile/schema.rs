//! Configuration schemas for providers
//!
//! A provider may declare the environment variables and arguments it needs,
//! either in its initialize result or in a companion manifest next to its
//! package. The gateway only caches these declarations; prompting the user
//! is the add collaborator's job.

use serde::{Deserialize, Serialize};

/// Declared configuration requirements for one provider
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationSchema {
    /// Required/optional environment variables
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<ConfigVariable>,
    /// Required/optional command arguments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<ConfigVariable>,
}

impl ConfigurationSchema {
    /// Names of required variables missing from the given environment
    #[must_use]
    pub fn missing_required<'a>(
        &'a self,
        env: &std::collections::BTreeMap<String, String>,
    ) -> Vec<&'a str> {
        self.env
            .iter()
            .filter(|v| v.required && !env.contains_key(&v.name))
            .map(|v| v.name.as_str())
            .collect()
    }
}

/// One declared variable or argument
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigVariable {
    /// Variable name
    pub name: String,
    /// What the variable is for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Whether the provider refuses to start without it
    #[serde(default)]
    pub required: bool,
    /// Whether the value is a secret (never logged, clipboard-injected by
    /// the add collaborator)
    #[serde(default)]
    pub sensitive: bool,
    /// Validation pattern, when the provider declares one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    /// Default value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    /// Example values
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub examples: Vec<String>,
}
