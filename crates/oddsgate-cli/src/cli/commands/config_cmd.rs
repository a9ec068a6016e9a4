//! Configuration display command.

use oddsgate::{Config, Settings};

use crate::cli::icons::dim_arrow;

/// Print the effective settings as TOML (or JSON).
pub fn cmd_config_show(settings: &Settings, json: bool) -> anyhow::Result<()> {
    let config = Config::from_settings(settings);

    if json {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    match settings.source_path {
        Some(ref path) => eprintln!("{} Loaded from {}", dim_arrow(), path.display()),
        None => eprintln!("{} No config file found, showing defaults", dim_arrow()),
    }
    print!("{}", config.to_toml()?);
    Ok(())
}
