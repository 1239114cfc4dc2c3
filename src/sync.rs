//! Auto-sync
//!
//! Additive import of providers from detected upstream client
//! configurations and extension bundles. Runs on startup and on demand.
//! Providers already in the profile are never overwritten: syncing twice
//! against an unchanged upstream performs zero additions the second time.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::profile::{Profile, Provenance, ProviderSpec};

/// How a client's configuration document is shaped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// Standard top-level `mcpServers` object
    McpServers,
    /// VS Code user settings: servers nested under `"mcp" -> "servers"`
    VsCodeSettings,
}

/// One detectable upstream client
#[derive(Debug, Clone)]
pub struct ClientSource {
    /// Display name, used in provenance tags and logs
    pub name: String,
    /// Path of the configuration document, if resolvable on this OS
    pub config_path: Option<PathBuf>,
    /// Document shape
    pub format: ConfigFormat,
    /// Directory of installed extension bundles, if the client has one
    pub extensions_dir: Option<PathBuf>,
}

/// A provider discovered upstream
#[derive(Debug, Clone)]
pub struct DiscoveredProvider {
    /// Provider name
    pub name: String,
    /// Converted spec, provenance already attached
    pub spec: ProviderSpec,
}

/// Outcome of one sync run
#[derive(Debug, Default)]
pub struct SyncReport {
    /// Names added to the profile, in discovery order
    pub added: Vec<String>,
    /// Providers skipped because they already existed
    pub skipped: usize,
}

/// Additive importer over the client detection matrix
pub struct AutoSync {
    sources: Vec<ClientSource>,
}

impl AutoSync {
    /// Build a syncer over the default client matrix for this OS
    #[must_use]
    pub fn new() -> Self {
        Self {
            sources: default_sources(),
        }
    }

    /// Build a syncer over explicit sources (tests, custom setups)
    #[must_use]
    pub fn with_sources(sources: Vec<ClientSource>) -> Self {
        Self { sources }
    }

    /// Scan every source and return all discovered providers.
    ///
    /// Sources that are missing or unparseable are skipped with a log line;
    /// one broken client never blocks the others.
    pub async fn discover(&self) -> Vec<DiscoveredProvider> {
        let mut discovered = Vec::new();
        for source in &self.sources {
            if let Some(path) = &source.config_path {
                match tokio::fs::read_to_string(path).await {
                    Ok(content) => match serde_json::from_str::<Value>(&content) {
                        Ok(document) => {
                            let found = parse_document(source, &document);
                            debug!(
                                client = %source.name,
                                providers = found.len(),
                                "Scanned client config"
                            );
                            discovered.extend(found);
                        }
                        Err(e) => {
                            warn!(client = %source.name, error = %e, "Unparseable client config")
                        }
                    },
                    Err(_) => debug!(client = %source.name, "Client config not present"),
                }
            }

            if let Some(dir) = &source.extensions_dir {
                discovered.extend(scan_extensions(&source.name, dir));
            }
        }
        discovered
    }

    /// Import newly discovered providers into the profile. Additive only.
    pub async fn import_into(&self, profile: &mut Profile) -> SyncReport {
        let mut report = SyncReport::default();
        for provider in self.discover().await {
            if profile.contains(&provider.name) {
                report.skipped += 1;
                continue;
            }
            match profile.add(provider.name.clone(), provider.spec) {
                Ok(()) => {
                    info!(provider = %provider.name, "Imported provider from upstream client");
                    report.added.push(provider.name);
                }
                Err(e) => warn!(provider = %provider.name, error = %e, "Skipping invalid import"),
            }
        }
        report
    }
}

impl Default for AutoSync {
    fn default() -> Self {
        Self::new()
    }
}

/// The client detection matrix for this OS
fn default_sources() -> Vec<ClientSource> {
    let Some(home) = dirs::home_dir() else {
        return Vec::new();
    };

    #[cfg(target_os = "macos")]
    let (claude_dir, vscode_settings) = (
        home.join("Library/Application Support/Claude"),
        home.join("Library/Application Support/Code/User/settings.json"),
    );
    #[cfg(target_os = "linux")]
    let (claude_dir, vscode_settings) = (
        home.join(".config/Claude"),
        home.join(".config/Code/User/settings.json"),
    );
    #[cfg(target_os = "windows")]
    let (claude_dir, vscode_settings) = (
        home.join("AppData/Roaming/Claude"),
        home.join("AppData/Roaming/Code/User/settings.json"),
    );

    vec![
        ClientSource {
            name: "Claude Desktop".to_string(),
            config_path: Some(claude_dir.join("claude_desktop_config.json")),
            format: ConfigFormat::McpServers,
            extensions_dir: Some(claude_dir.join("extensions")),
        },
        ClientSource {
            name: "Claude Code".to_string(),
            config_path: Some(home.join(".claude.json")),
            format: ConfigFormat::McpServers,
            extensions_dir: None,
        },
        ClientSource {
            name: "Cursor".to_string(),
            config_path: Some(home.join(".cursor/mcp.json")),
            format: ConfigFormat::McpServers,
            extensions_dir: None,
        },
        ClientSource {
            name: "Windsurf".to_string(),
            config_path: Some(home.join(".codeium/windsurf/mcp_config.json")),
            format: ConfigFormat::McpServers,
            extensions_dir: None,
        },
        ClientSource {
            name: "VS Code".to_string(),
            config_path: Some(vscode_settings),
            format: ConfigFormat::VsCodeSettings,
            extensions_dir: None,
        },
    ]
}

/// Parse a client document into provider specs
fn parse_document(source: &ClientSource, document: &Value) -> Vec<DiscoveredProvider> {
    let servers = match source.format {
        ConfigFormat::McpServers => document.get("mcpServers"),
        ConfigFormat::VsCodeSettings => document.get("mcp").and_then(|m| m.get("servers")),
    };
    let Some(servers) = servers.and_then(Value::as_object) else {
        return Vec::new();
    };

    servers
        .iter()
        .filter_map(|(name, config)| {
            parse_server_entry(config).map(|mut spec| {
                spec.provenance = Some(Provenance {
                    source: source.name.clone(),
                    imported_at: Utc::now(),
                });
                DiscoveredProvider {
                    name: name.clone(),
                    spec,
                }
            })
        })
        .collect()
}

/// Convert one `{command, args?, env?}` entry; URL-only servers have no
/// stdio transport here and are skipped.
fn parse_server_entry(config: &Value) -> Option<ProviderSpec> {
    let command = config.get("command")?.as_str()?.to_string();
    let args = config
        .get("args")
        .and_then(Value::as_array)
        .map(|array| {
            array
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default();
    let env: BTreeMap<String, String> = config
        .get("env")
        .and_then(Value::as_object)
        .map(|object| {
            object
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();

    Some(ProviderSpec {
        command,
        args,
        env,
        provenance: None,
    })
}

/// Scan an extensions directory for bundle manifests.
///
/// A bundle is a directory containing `manifest.json` with a `server`
/// object in the standard `{command, args?, env?}` shape.
fn scan_extensions(client: &str, dir: &std::path::Path) -> Vec<DiscoveredProvider> {
    if !dir.exists() {
        return Vec::new();
    }

    let mut discovered = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(2)
        .max_depth(2)
        .into_iter()
        .filter_map(std::result::Result::ok)
    {
        if entry.file_name().to_str() != Some("manifest.json") {
            continue;
        }
        let Ok(content) = std::fs::read_to_string(entry.path()) else {
            continue;
        };
        let Ok(manifest) = serde_json::from_str::<Value>(&content) else {
            warn!(client, path = %entry.path().display(), "Unparseable extension manifest");
            continue;
        };

        let name = manifest
            .get("name")
            .and_then(Value::as_str)
            .map(String::from)
            .or_else(|| {
                entry
                    .path()
                    .parent()
                    .and_then(|p| p.file_name())
                    .map(|n| n.to_string_lossy().into_owned())
            });

        if let (Some(name), Some(server)) = (name, manifest.get("server"))
            && let Some(mut spec) = parse_server_entry(server)
        {
            spec.provenance = Some(Provenance {
                source: format!("{client} extension"),
                imported_at: Utc::now(),
            });
            discovered.push(DiscoveredProvider { name, spec });
        }
    }
    discovered
}
