//! Config command implementation.

use anyhow::{Context, Result, bail};

use crate::cli::ConfigAction;
use crate::config::Config;

pub fn cmd_config(action: ConfigAction, config: &Config) -> Result<()> {
    match action {
        ConfigAction::Path => {
            println!("{}", Config::path().display());
        }
        ConfigAction::Show => {
            let path = Config::path();
            if !path.exists() {
                eprintln!("No config file at {}; showing defaults", path.display());
            }
            let content = toml::to_string_pretty(&effective(config))
                .context("Failed to serialize config")?;
            print!("{}", content);
        }
        ConfigAction::Init { force } => {
            let path = Config::path();
            if path.exists() && !force {
                bail!(
                    "Config file already exists at {} (use --force to overwrite)",
                    path.display()
                );
            }
            Config::with_defaults().save_to(&path)?;
            println!("Wrote {}", path.display());
        }
    }
    Ok(())
}

/// `config` with unset values filled from the defaults.
fn effective(config: &Config) -> Config {
    let defaults = Config::with_defaults();
    Config {
        scan_duration: config.scan_duration.or(defaults.scan_duration),
        settle_interval_ms: config.settle_interval_ms.or(defaults.settle_interval_ms),
        target_mtu: config.target_mtu.or(defaults.target_mtu),
        mtu_floor: config.mtu_floor.or(defaults.mtu_floor),
        dedup: config.dedup.or(defaults.dedup),
    }
}
