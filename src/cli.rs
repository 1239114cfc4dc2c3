//! Command-line interface

use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};

use crate::config::{self, Settings};
use crate::profile::{ProviderSpec, store::ProfileStore};
use crate::sync::AutoSync;

/// N-to-1 MCP gateway with semantic tool discovery
#[derive(Parser, Debug)]
#[command(name = "ncp-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Profile to load
    #[arg(short, long, default_value = "default", env = "NCP_PROFILE")]
    pub profile: String,

    /// Data directory (profiles, caches, schemas)
    #[arg(long, env = "NCP_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "NCP_LOG_LEVEL")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "NCP_LOG_FORMAT")]
    pub log_format: Option<String>,

    /// Skip auto-sync of upstream client configurations on startup
    #[arg(long)]
    pub no_sync: bool,

    /// Suppress interactive confirmation (automated environments)
    #[arg(long, env = "NCP_NO_CONFIRM")]
    pub no_confirm: bool,

    /// Subcommand; defaults to serving the gateway over stdio
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Profile management subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the gateway over stdio (default)
    Serve,
    /// Add a provider to the profile
    Add {
        /// Provider name (becomes the FQTN prefix)
        name: String,
        /// Command to launch the provider
        command: String,
        /// Arguments passed to the command
        args: Vec<String>,
        /// Environment variables, KEY=VALUE (repeatable)
        #[arg(short, long)]
        env: Vec<String>,
    },
    /// Remove a provider from the profile
    Remove {
        /// Provider name
        name: String,
    },
    /// List providers in the profile
    List,
    /// Import new providers from detected upstream client configurations
    Sync,
}

/// Run a profile-management subcommand.
///
/// # Errors
///
/// Returns an error when the profile cannot be loaded or mutated; the
/// process exit code reflects it.
pub async fn run_command(cli: &Cli, command: &Command) -> anyhow::Result<()> {
    let data_dir = config::resolve_data_dir(cli.data_dir.as_deref())
        .context("resolving data directory")?;
    let _settings = Settings::load(&data_dir).context("loading settings")?;
    let store = ProfileStore::new(&data_dir);

    match command {
        Command::Serve => unreachable!("serve is handled by main"),
        Command::Add {
            name,
            command,
            args,
            env,
        } => {
            let mut profile = store.load(&cli.profile).await?;
            let mut env_map = std::collections::BTreeMap::new();
            for pair in env {
                let Some((k, v)) = pair.split_once('=') else {
                    bail!("invalid --env '{pair}', expected KEY=VALUE");
                };
                env_map.insert(k.to_string(), v.to_string());
            }
            profile.add(
                name.clone(),
                ProviderSpec {
                    command: command.clone(),
                    args: args.clone(),
                    env: env_map,
                    provenance: None,
                },
            )?;
            store.save(&cli.profile, &profile).await?;
            println!("Added provider '{name}' to profile '{}'", cli.profile);
        }
        Command::Remove { name } => {
            let mut profile = store.load(&cli.profile).await?;
            profile.remove(name)?;
            store.save(&cli.profile, &profile).await?;
            println!("Removed provider '{name}' from profile '{}'", cli.profile);
        }
        Command::List => {
            let profile = store.load(&cli.profile).await?;
            for (name, spec) in profile.providers() {
                let provenance = spec
                    .provenance
                    .as_ref()
                    .map(|p| format!("  [{}]", p.source))
                    .unwrap_or_default();
                println!("{name}: {} {}{provenance}", spec.command, spec.args.join(" "));
            }
            println!(
                "{} provider(s) in profile '{}'",
                profile.providers().len(),
                cli.profile
            );
        }
        Command::Sync => {
            let mut profile = store.load(&cli.profile).await?;
            let report = AutoSync::new().import_into(&mut profile).await;
            if report.added.is_empty() {
                println!("Nothing to import; profile already current");
            } else {
                store.save(&cli.profile, &profile).await?;
                for name in &report.added {
                    println!("Imported provider '{name}'");
                }
            }
        }
    }

    Ok(())
}
