//! Offline commands: registry dumps and configuration handling.

use std::path::{Path, PathBuf};

use anyhow::{Context, bail};

use gamegrid_core::{GridConfig, format_duration};
use gamegrid_state::Registry;

/// Registry file inside the data directory.
pub const DB_FILE: &str = "gamegrid.redb";

/// Load a config file, or the built-in defaults when no path is given.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<GridConfig> {
    match path {
        Some(path) => GridConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(GridConfig::default()),
    }
}

fn open_existing(data_dir: &Path) -> anyhow::Result<Registry> {
    let db_path: PathBuf = data_dir.join(DB_FILE);
    if !db_path.exists() {
        bail!("no registry at {}", db_path.display());
    }
    Ok(Registry::open(&db_path)?)
}

pub fn vms(data_dir: &Path) -> anyhow::Result<()> {
    let registry = open_existing(data_dir)?;
    let vms = registry.list_vms()?;
    println!("{}", serde_json::to_string_pretty(&vms)?);
    Ok(())
}

pub fn sessions(data_dir: &Path, active_only: bool) -> anyhow::Result<()> {
    let registry = open_existing(data_dir)?;
    let mut sessions = registry.list_sessions()?;
    if active_only {
        sessions.retain(|s| s.is_active());
    }
    sessions.sort_by_key(|s| s.started_at);
    println!("{}", serde_json::to_string_pretty(&sessions)?);
    Ok(())
}

pub fn check_config(path: &Path) -> anyhow::Result<()> {
    let config = load_config(Some(path))?;
    print!("{}", describe_config(&config)?);
    Ok(())
}

/// Human-readable summary of the resolved settings.
fn describe_config(config: &GridConfig) -> anyhow::Result<String> {
    let pool = config.pool_settings()?;
    let games = config.games()?;
    let streaming = config.streaming_settings();

    let optional = |d: Option<std::time::Duration>| d.map(format_duration).unwrap_or_else(|| "off".into());

    let mut out = String::new();
    out.push_str("[pool]\n");
    out.push_str(&format!("  scan_interval           {}\n", format_duration(pool.scan_interval)));
    out.push_str(&format!("  idle_timeout            {}\n", format_duration(pool.idle_timeout)));
    out.push_str(&format!("  provision_timeout       {}\n", format_duration(pool.provision_timeout)));
    out.push_str(&format!("  poll_interval           {}\n", format_duration(pool.poll_interval)));
    out.push_str(&format!("  max_poll_backoff        {}\n", format_duration(pool.max_poll_backoff)));
    out.push_str(&format!("  provider_call_timeout   {}\n", format_duration(pool.provider_call_timeout)));
    out.push_str(&format!("  allocation_retries      {}\n", pool.allocation_retries));
    out.push_str(&format!("  heartbeat_interval      {}\n", optional(pool.heartbeat_interval)));
    out.push_str(&format!("  terminate_stopped_after {}\n", optional(pool.terminate_stopped_after)));
    out.push_str("[streaming]\n");
    out.push_str(&format!("  endpoint_template       {}\n", streaming.endpoint_template));
    out.push_str(&format!("[games] {}\n", games.len()));
    for game in &games {
        out.push_str(&format!(
            "  {:<20} {} per vm  {}\n",
            game.id,
            game.max_sessions_per_vm,
            game.name.as_deref().unwrap_or("")
        ));
    }
    Ok(out)
}

pub fn init(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    let content = GridConfig::scaffold().to_toml_string()?;
    std::fs::write(path, content).with_context(|| format!("writing {}", path.display()))?;
    println!("wrote {}", path.display());
    Ok(())
}
