//! Fully-qualified tool names
//!
//! An FQTN is `provider:tool`. The first colon separates the provider from
//! the tool; tool names may themselves contain colons past that point.

use crate::{Error, Result};

/// A parsed fully-qualified tool name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fqtn {
    /// Provider name (profile key)
    pub provider: String,
    /// Raw tool name as the provider knows it
    pub tool: String,
}

impl Fqtn {
    /// Build an FQTN from its parts
    #[must_use]
    pub fn new(provider: impl Into<String>, tool: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            tool: tool.into(),
        }
    }

    /// Parse a `provider:tool` string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] when the separator is missing or
    /// either side is empty.
    pub fn parse(raw: &str) -> Result<Self> {
        let (provider, tool) = raw
            .split_once(':')
            .ok_or_else(|| Error::InvalidRequest(format!("not a qualified tool name: {raw}")))?;
        if provider.is_empty() || tool.is_empty() {
            return Err(Error::InvalidRequest(format!(
                "malformed qualified tool name: {raw}"
            )));
        }
        Ok(Self::new(provider, tool))
    }

    /// Canonical `provider:tool` form.
    ///
    /// Writers always emit this form; unprefixed legacy names are accepted
    /// only by cache readers, which normalize through
    /// [`Fqtn::normalize_cached`].
    #[must_use]
    pub fn canonical(&self) -> String {
        format!("{}:{}", self.provider, self.tool)
    }

    /// Normalize a tool name read from a cache entry owned by `provider`.
    ///
    /// Legacy caches stored unprefixed names; those get the owning provider
    /// prepended. Already-canonical names pass through untouched.
    #[must_use]
    pub fn normalize_cached(provider: &str, stored: &str) -> Self {
        match stored.split_once(':') {
            Some((p, tool)) if p == provider => Self::new(provider, tool),
            // A colon with a foreign prefix means the tool name itself
            // contains a colon; the owning provider wins.
            Some(_) | None => Self::new(provider, stored),
        }
    }
}

impl std::fmt::Display for Fqtn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.provider, self.tool)
    }
}
