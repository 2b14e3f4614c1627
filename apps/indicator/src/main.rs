use std::{fs, path::PathBuf, sync::Arc};

use anyhow::{bail, Context, Result};
use clap::Parser;
use client_core::{connect, ControllerSlot, LinkSettings, SystemSignals};
use serde::Deserialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Terminal indicator for a single Home Assistant entity: prints every
/// confirmed state change until interrupted.
#[derive(Parser, Debug)]
#[command(name = "indicator")]
struct Args {
    /// Settings file; missing file is fine when flags or env cover everything.
    #[arg(long, default_value = "indicator.toml")]
    settings: PathBuf,
    /// Base URL of the Home Assistant instance, e.g. http://hub.local:8123.
    #[arg(long)]
    url: Option<String>,
    /// Long-lived access token.
    #[arg(long)]
    access_token: Option<String>,
    /// Entity to track, e.g. light.kitchen.
    #[arg(long)]
    entity: Option<String>,
    /// Label to print instead of the entity id.
    #[arg(long)]
    display_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SettingsFile {
    url: Option<String>,
    access_token: Option<String>,
    entity: Option<String>,
    display_name: Option<String>,
}

fn load_settings_file(path: &PathBuf) -> Result<SettingsFile> {
    if !path.exists() {
        return Ok(SettingsFile::default());
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read settings file {}", path.display()))?;
    toml::from_str(&raw)
        .with_context(|| format!("failed to parse settings file {}", path.display()))
}

fn read_non_empty_env_var(name: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(value) if value.trim().is_empty() => None,
        Ok(value) => Some(value),
        Err(_) => None,
    }
}

/// Flag beats environment beats settings file.
fn resolve_setting(
    flag: Option<String>,
    env_name: &str,
    file_value: Option<String>,
) -> Option<String> {
    flag.or_else(|| read_non_empty_env_var(env_name))
        .or(file_value)
}

fn resolve(args: Args, file: SettingsFile) -> Result<(LinkSettings, Option<String>)> {
    let Some(url) = resolve_setting(args.url, "HA_URL", file.url) else {
        bail!("no hub URL configured; pass --url, set HA_URL, or add url to the settings file");
    };
    let Some(access_token) = resolve_setting(args.access_token, "HA_ACCESS_TOKEN", file.access_token)
    else {
        bail!(
            "no access token configured; pass --access-token, set HA_ACCESS_TOKEN, \
             or add access_token to the settings file"
        );
    };
    let Some(entity_id) = resolve_setting(args.entity, "HA_ENTITY", file.entity) else {
        bail!("no entity configured; pass --entity, set HA_ENTITY, or add entity to the settings file");
    };
    let display_name = args.display_name.or(file.display_name);
    Ok((
        LinkSettings {
            url,
            access_token,
            entity_id,
        },
        display_name,
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let args = Args::parse();

    let file = load_settings_file(&args.settings)?;
    let (settings, display_name) = resolve(args, file)?;
    let label = display_name.unwrap_or_else(|| settings.entity_id.clone());

    let signals = SystemSignals::new();
    let slot = ControllerSlot::new();
    let controller = connect(&settings, &signals).await?;
    slot.install(Arc::clone(&controller)).await;

    {
        let label = label.clone();
        let probe = Arc::clone(&controller);
        controller.set_on_update(Box::new(move |state| {
            match probe.formatted_state_value() {
                Some(value) => println!("{label}: {} ({value})", state.state),
                None => println!("{label}: {}", state.state),
            }
        }));
    }

    info!(entity = %settings.entity_id, "tracking entity, press ctrl-c to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    slot.close_current().await;
    info!("stopped");
    Ok(())
}
