//! usbgate command-line interface for inspecting and seeding the authorization registry.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::warn;
use schemars::schema_for;
use serde_json::to_string_pretty;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use usbgate_core::{
    config::{bootstrap_template, config_path_from_env, UsbgateConfig},
    logging, DeviceId, Registry, RemoteSynchronizer,
};

fn load_cli_config(path: &Path) -> Result<UsbgateConfig> {
    let config = UsbgateConfig::load_or_bootstrap(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;

    if config.path != path {
        println!(
            "Using bootstrap configuration at {} (set USBGATE_CONFIG to override).",
            config.path.display()
        );
    }

    Ok(config)
}

/// Top-level command-line options shared by every subcommand.
#[derive(Parser, Debug)]
#[command(
    name = "usbgate",
    version,
    about = "Inspect attached USB devices and manage the usbgate authorization registry."
)]
struct Cli {
    /// Path to the usbgate configuration file (defaults to $USBGATE_CONFIG or /etc/usbgate.toml).
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List attached USB mass-storage devices and whether each is authorized.
    Devices,

    /// Print every identifier in the authorization registry.
    List,

    /// Add identifiers to the registry (entries are never removed).
    Authorize {
        /// Device serials to authorize; normalised before storing.
        ids: Vec<String>,

        /// Also authorize every device attached right now.
        #[arg(long)]
        present: bool,
    },

    /// Fetch the remote device list once and merge it into the registry.
    Sync,

    /// Check the configuration and report problems.
    Validate,

    /// Write a bootstrap configuration to PATH (or print it when omitted).
    InitConfig {
        path: Option<PathBuf>,

        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },

    /// Print the JSON schema of the configuration file.
    Schema,
}

fn main() {
    logging::init("warn");
    if let Err(err) = run(Cli::parse()) {
        eprintln!("error: {err:?}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.clone().unwrap_or_else(config_path_from_env);

    match cli.command {
        Commands::Devices => {
            let config = load_cli_config(&config_path)?;
            let registry = Registry::load(config.store_path());
            let present = poll_devices(&config);
            if present.is_empty() {
                println!("No USB mass-storage devices detected.");
                return Ok(());
            }
            for id in &present {
                let marker = if registry.contains(id) {
                    "authorized"
                } else {
                    "unknown"
                };
                println!("{id}\t{marker}");
            }
        }
        Commands::List => {
            let config = load_cli_config(&config_path)?;
            let registry = Registry::load(config.store_path());
            if registry.is_empty() {
                println!("Registry at {} is empty.", registry.store_path().display());
            }
            for id in registry.snapshot() {
                println!("{id}");
            }
        }
        Commands::Authorize { ids, present } => {
            let config = load_cli_config(&config_path)?;
            let incoming = authorize_selection(&ids, present.then(|| poll_devices(&config)))?;
            let registry = Registry::load(config.store_path());
            if registry.merge(incoming.iter().cloned()) {
                println!(
                    "Registry now holds {} device(s) at {}.",
                    registry.len(),
                    registry.store_path().display()
                );
            } else {
                println!("All {} device(s) were already authorized.", incoming.len());
            }
        }
        Commands::Sync => {
            let config = load_cli_config(&config_path)?;
            let remote = RemoteSynchronizer::from_config(&config)?;
            if !remote.is_enabled() {
                bail!("remote.url is not configured in {}", config.path.display());
            }
            let registry = Registry::load(config.store_path());
            let runtime = tokio::runtime::Runtime::new().context("start async runtime")?;
            if runtime.block_on(remote.sync_into(&registry)) {
                println!("Registry updated; {} device(s) authorized.", registry.len());
            } else {
                println!("Registry unchanged ({} device(s)).", registry.len());
            }
        }
        Commands::Validate => {
            let config = load_cli_config(&config_path)?;
            let issues = config.validate();
            if issues.is_empty() {
                println!("{} looks good.", config.path.display());
            } else {
                for issue in &issues {
                    println!("- {issue}");
                }
                bail!("{} configuration issue(s) found", issues.len());
            }
        }
        Commands::InitConfig { path, force } => match path {
            Some(path) => {
                if path.exists() && !force {
                    bail!("{} already exists (use --force to overwrite)", path.display());
                }
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&path, bootstrap_template())
                    .with_context(|| format!("write {}", path.display()))?;
                println!("Wrote bootstrap configuration to {}.", path.display());
            }
            None => print!("{}", bootstrap_template()),
        },
        Commands::Schema => {
            let schema = schema_for!(UsbgateConfig);
            println!("{}", to_string_pretty(&schema)?);
        }
    }

    Ok(())
}

fn poll_devices(config: &UsbgateConfig) -> BTreeSet<DeviceId> {
    usbgate_usb::system_lister(config.query_timeout()).poll()
}

/// Combine explicitly named identifiers with the currently attached devices.
fn authorize_selection(
    ids: &[String],
    attached: Option<BTreeSet<DeviceId>>,
) -> Result<BTreeSet<DeviceId>> {
    let mut selection = BTreeSet::new();
    for raw in ids {
        selection.insert(raw.parse::<DeviceId>()?);
    }

    if let Some(attached) = attached {
        if attached.is_empty() {
            warn!("--present requested but no USB devices are attached");
        }
        selection.extend(attached);
    }

    if selection.is_empty() {
        bail!("nothing to authorize; pass device serials or --present");
    }
    Ok(selection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn authorize_selection_normalises_and_merges_attached() {
        let attached: BTreeSet<DeviceId> = [DeviceId::new("PRESENT1").unwrap()].into_iter().collect();
        let selection =
            authorize_selection(&["abc-123".to_string()], Some(attached)).unwrap();
        let rendered: Vec<&str> = selection.iter().map(DeviceId::as_str).collect();
        assert_eq!(rendered, vec!["ABC123", "PRESENT1"]);
    }

    #[test]
    fn authorize_selection_rejects_blank_serials() {
        assert!(authorize_selection(&["--".to_string()], None).is_err());
    }

    #[test]
    fn authorize_selection_requires_something() {
        assert!(authorize_selection(&[], None).is_err());
        assert!(authorize_selection(&[], Some(BTreeSet::new())).is_err());
    }
}
