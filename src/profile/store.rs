//! On-disk profile persistence

use std::path::{Path, PathBuf};

use tracing::debug;

use super::{ConfigurationSchema, Profile};
use crate::{Error, Result};

/// Loads and saves profile documents under `<data-dir>/profiles/`
/// and configuration schemas under `<data-dir>/schemas/`.
pub struct ProfileStore {
    profiles_dir: PathBuf,
    schemas_dir: PathBuf,
}

impl ProfileStore {
    /// Create a store rooted at the data directory
    #[must_use]
    pub fn new(data_dir: &Path) -> Self {
        Self {
            profiles_dir: data_dir.join("profiles"),
            schemas_dir: data_dir.join("schemas"),
        }
    }

    /// Path of a named profile document
    #[must_use]
    pub fn profile_path(&self, name: &str) -> PathBuf {
        self.profiles_dir.join(format!("{name}.json"))
    }

    /// Load a named profile. A missing file yields an empty profile.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub async fn load(&self, name: &str) -> Result<Profile> {
        let path = self.profile_path(name);
        if !path.exists() {
            debug!(profile = name, "Profile not found, starting empty");
            return Ok(Profile::default());
        }
        let content = tokio::fs::read_to_string(&path).await?;
        let profile: Profile = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("profile {name} is not valid JSON: {e}")))?;
        Ok(profile)
    }

    /// Save a named profile atomically (write temp, then rename).
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the write fails.
    pub async fn save(&self, name: &str, profile: &Profile) -> Result<()> {
        tokio::fs::create_dir_all(&self.profiles_dir).await?;
        let path = self.profile_path(name);
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(profile)?;
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(profile = name, providers = profile.providers().len(), "Profile saved");
        Ok(())
    }

    /// Load a provider's cached configuration schema, if one was stored.
    pub async fn load_schema(&self, provider: &str) -> Option<ConfigurationSchema> {
        let path = self.schemas_dir.join(format!("{provider}.schema.json"));
        let content = tokio::fs::read_to_string(&path).await.ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Cache a provider's configuration schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema directory cannot be created or written.
    pub async fn save_schema(&self, provider: &str, schema: &ConfigurationSchema) -> Result<()> {
        tokio::fs::create_dir_all(&self.schemas_dir).await?;
        let path = self.schemas_dir.join(format!("{provider}.schema.json"));
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_string_pretty(schema)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Remove a provider's cached schema; missing files are fine.
    pub async fn remove_schema(&self, provider: &str) {
        let path = self.schemas_dir.join(format!("{provider}.schema.json"));
        let _ = tokio::fs::remove_file(&path).await;
    }
}
