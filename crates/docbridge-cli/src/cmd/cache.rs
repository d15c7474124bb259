use crate::output::print_json;
use anyhow::Context;
use clap::Subcommand;
use docbridge_core::cache::CacheStore;
use docbridge_core::error::BridgeError;
use docbridge_core::paths;
use std::path::Path;

#[derive(Subcommand)]
pub enum CacheSubcommand {
    /// Show the full cached entry for one work item
    Show { id: u64 },

    /// Remove every cached entry (processing restarts from scratch)
    Clear,
}

pub fn run(root: &Path, subcommand: CacheSubcommand, json: bool) -> anyhow::Result<()> {
    let cache = CacheStore::open(&paths::cache_path(root))?;
    match subcommand {
        CacheSubcommand::Show { id } => {
            let entry = cache
                .get(id)?
                .ok_or(BridgeError::ItemNotCached(id))
                .context("cache lookup failed")?;
            print_json(&entry)
        }
        CacheSubcommand::Clear => {
            let removed = cache.clear()?;
            if json {
                print_json(&serde_json::json!({ "removed": removed }))
            } else {
                println!("removed {removed} cached entries");
                Ok(())
            }
        }
    }
}
