use anyhow::Context;
use docbridge_core::config::Config;
use docbridge_core::tracker::QueryLocator;
use docbridge_core::{io, paths};
use std::path::Path;

pub fn run(root: &Path, query_url: &str) -> anyhow::Result<()> {
    // Reject a bad query URL now instead of on the first fetch.
    QueryLocator::parse(query_url)
        .with_context(|| format!("'{query_url}' is not a saved-query URL"))?;

    println!("Initializing docbridge in: {}", root.display());

    io::ensure_dir(&paths::data_dir(root))
        .with_context(|| format!("failed to create {}", paths::DATA_DIR))?;

    let config_path = paths::config_path(root);
    if config_path.exists() {
        println!("  exists:  {}", paths::CONFIG_FILE);
    } else {
        let cfg = Config::new(query_url);
        cfg.save(root).context("failed to write config")?;
        println!("  created: {}", paths::CONFIG_FILE);
    }

    println!("\nSet {} and {} before processing.", super::ADO_PAT_VAR, super::GITHUB_TOKEN_VAR);
    println!("Next: docbridge process --dry-run");
    Ok(())
}
