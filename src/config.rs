//! Gateway settings
//!
//! Settings are layered: built-in defaults, then an optional `settings.yaml`
//! in the data directory, then `NCP_`-prefixed environment variables. The
//! profile document (which providers to run) lives separately in the profile
//! store; this module only covers how the gateway itself behaves.

use std::{env, path::Path, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Environment variable overriding the data directory
pub const DATA_DIR_ENV: &str = "NCP_DATA_DIR";

/// Environment variable suppressing interactive confirmation
pub const NO_CONFIRM_ENV: &str = "NCP_NO_CONFIRM";

/// Gateway settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Environment files to load before spawning providers.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Provider spawn + initialize budget in seconds
    pub spawn_timeout_secs: u64,
    /// Per-call budget in seconds (override-able per call)
    pub call_timeout_secs: u64,
    /// Wall-clock budget for the whole `find` pipeline in milliseconds
    pub find_timeout_ms: u64,
    /// Idle threshold before a connection is evicted, in seconds
    pub idle_threshold_secs: u64,
    /// Maximum concurrent provider spawns during reconciliation
    pub spawn_fanout: usize,
    /// Consecutive failures before a provider is marked unhealthy
    pub failure_threshold: u32,
    /// Health cooldown backoff cap in seconds
    pub cooldown_cap_secs: u64,
    /// Minimum cosine similarity for dense retrieval
    pub base_threshold: f64,
    /// Suppress interactive confirmation (automated environments)
    pub no_confirm: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            env_files: Vec::new(),
            spawn_timeout_secs: 30,
            call_timeout_secs: 45,
            find_timeout_ms: 2_000,
            idle_threshold_secs: 300,
            spawn_fanout: 16,
            failure_threshold: 3,
            cooldown_cap_secs: 300,
            base_threshold: 0.35,
            no_confirm: false,
        }
    }
}

impl Settings {
    /// Load settings from the data directory and environment
    ///
    /// # Errors
    ///
    /// Returns an error if a present settings file cannot be parsed.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let mut figment = Figment::new();

        let settings_path = data_dir.join("settings.yaml");
        if settings_path.exists() {
            figment = figment.merge(Yaml::file(&settings_path));
        }

        figment = figment.merge(Env::prefixed("NCP_").split("__"));

        let mut settings: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        if env::var(NO_CONFIRM_ENV).is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true")) {
            settings.no_confirm = true;
        }

        settings.load_env_files();

        Ok(settings)
    }

    /// Spawn + initialize budget
    #[must_use]
    pub fn spawn_timeout(&self) -> Duration {
        Duration::from_secs(self.spawn_timeout_secs)
    }

    /// Default per-call budget
    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// `find` pipeline budget
    #[must_use]
    pub fn find_timeout(&self) -> Duration {
        Duration::from_millis(self.find_timeout_ms)
    }

    /// Idle eviction threshold
    #[must_use]
    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.idle_threshold_secs)
    }

    /// Health cooldown backoff cap
    #[must_use]
    pub fn cooldown_cap(&self) -> Duration {
        Duration::from_secs(self.cooldown_cap_secs)
    }

    /// Load environment files into the process environment.
    /// Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = expand_home(path_str);
            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }
}

/// Resolve the data directory: explicit flag, then `NCP_DATA_DIR`, then
/// the default under the user's home.
///
/// # Errors
///
/// Returns an error if no home directory can be determined and no override
/// is present.
pub fn resolve_data_dir(cli_override: Option<&Path>) -> Result<PathBuf> {
    if let Some(dir) = cli_override {
        return Ok(dir.to_path_buf());
    }
    if let Ok(dir) = env::var(DATA_DIR_ENV) {
        return Ok(PathBuf::from(expand_home(&dir)));
    }
    let home = dirs::home_dir()
        .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;
    Ok(home.join(".ncp"))
}

/// Expand a leading `~` to the user's home directory
#[must_use]
pub fn expand_home(path: &str) -> String {
    if path.starts_with('~')
        && let Some(home) = dirs::home_dir()
    {
        return path.replacen('~', &home.display().to_string(), 1);
    }
    path.to_string()
}

/// Expand `${VAR}` and `${VAR:-default}` patterns in a value.
///
/// Unset variables without a default are left verbatim so the pattern is
/// visible to whoever reads the spawned process environment.
#[must_use]
pub fn expand_env_vars(value: &str) -> String {
    static PATTERN: &str = r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}";
    let re = Regex::new(PATTERN).expect("static pattern compiles");
    re.replace_all(value, |caps: &regex::Captures<'_>| {
        let var = &caps[1];
        match env::var(var) {
            Ok(v) => v,
            Err(_) => caps
                .get(2)
                .map_or_else(|| caps[0].to_string(), |d| d.as_str().to_string()),
        }
    })
    .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_match_documented_budgets() {
        let s = Settings::default();
        assert_eq!(s.spawn_timeout(), Duration::from_secs(30));
        assert_eq!(s.call_timeout(), Duration::from_secs(45));
        assert_eq!(s.find_timeout(), Duration::from_millis(2_000));
        assert_eq!(s.idle_threshold(), Duration::from_secs(300));
        assert_eq!(s.spawn_fanout, 16);
        assert_eq!(s.failure_threshold, 3);
        assert!((s.base_threshold - 0.35).abs() < f64::EPSILON);
    }

    #[test]
    fn settings_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("settings.yaml"),
            "call_timeout_secs: 10\nspawn_fanout: 4\n",
        )
        .unwrap();

        let s = Settings::load(dir.path()).unwrap();
        assert_eq!(s.call_timeout(), Duration::from_secs(10));
        assert_eq!(s.spawn_fanout, 4);
        // Untouched keys keep defaults
        assert_eq!(s.spawn_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn missing_settings_file_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        let s = Settings::load(dir.path()).unwrap();
        assert_eq!(s.failure_threshold, 3);
    }

    #[test]
    fn expand_env_vars_with_default() {
        assert_eq!(
            expand_env_vars("${NCP_TEST_SURELY_UNSET:-fallback}"),
            "fallback"
        );
    }

    #[test]
    fn expand_env_vars_set_variable() {
        // PATH is set in any test environment
        let path = env::var("PATH").unwrap();
        assert_eq!(expand_env_vars("${PATH}"), path);
    }

    #[test]
    fn unset_without_default_left_verbatim() {
        assert_eq!(
            expand_env_vars("${NCP_TEST_SURELY_UNSET_2}"),
            "${NCP_TEST_SURELY_UNSET_2}"
        );
    }

    #[test]
    fn data_dir_cli_override_wins() {
        let dir = resolve_data_dir(Some(Path::new("/tmp/ncp-test"))).unwrap();
        assert_eq!(dir, PathBuf::from("/tmp/ncp-test"));
    }
}
