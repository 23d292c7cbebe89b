//! `prepflow prefetch` — run the lock-guarded populate step alone.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;

use prepflow::config::Config;
use prepflow::prefetch;

pub fn cmd_prefetch(config_path: &Path) -> Result<()> {
    let cfg = Config::load(config_path)?;
    let section = cfg
        .toml
        .prefetch
        .as_ref()
        .context("No [prefetch] section configured")?;
    prefetch::run(section)?;
    println!("{} shared reference dataset populated", style("ok").green());
    Ok(())
}
