use crate::output::{print_json, print_table};
use anyhow::Context;
use docbridge_core::cache::CacheStore;
use docbridge_core::config::Config;
use docbridge_core::paths;
use docbridge_core::types::ItemState;
use std::collections::BTreeMap;
use std::path::Path;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    // Surfaces NotInitialized before touching the cache file.
    Config::load(root).context("failed to load config")?;
    let cache = CacheStore::open(&paths::cache_path(root))?;
    let entries = cache.list()?;

    if json {
        #[derive(serde::Serialize)]
        struct ItemRow<'a> {
            id: u64,
            title: &'a str,
            state: ItemState,
            issue_url: Option<&'a str>,
            last_error: Option<&'a str>,
            attempts: u32,
        }

        #[derive(serde::Serialize)]
        struct StateOutput<'a> {
            items: Vec<ItemRow<'a>>,
            counts: BTreeMap<&'static str, usize>,
        }

        let items: Vec<ItemRow> = entries
            .iter()
            .map(|e| ItemRow {
                id: e.item.id,
                title: &e.item.title,
                state: e.record.state,
                issue_url: e.record.issue_url.as_deref(),
                last_error: e.record.last_error.as_deref(),
                attempts: e.record.attempt_count,
            })
            .collect();
        return print_json(&StateOutput {
            counts: state_counts(&entries.iter().map(|e| e.record.state).collect::<Vec<_>>()),
            items,
        });
    }

    if entries.is_empty() {
        println!("no cached work items (run 'docbridge fetch')");
        return Ok(());
    }

    let rows: Vec<Vec<String>> = entries
        .iter()
        .map(|e| {
            vec![
                e.item.id.to_string(),
                e.record.state.to_string(),
                e.item.title.clone(),
                e.record
                    .issue_url
                    .clone()
                    .or_else(|| e.record.last_error.clone())
                    .unwrap_or_default(),
            ]
        })
        .collect();
    print_table(&["ID", "STATE", "TITLE", "ISSUE / ERROR"], &rows);

    let states: Vec<ItemState> = entries.iter().map(|e| e.record.state).collect();
    let counts = state_counts(&states);
    let line: Vec<String> = counts.iter().map(|(s, n)| format!("{s}: {n}")).collect();
    println!("\n{}", line.join("  "));
    Ok(())
}

fn state_counts(states: &[ItemState]) -> BTreeMap<&'static str, usize> {
    let mut counts = BTreeMap::new();
    for state in states {
        *counts.entry(state.as_str()).or_insert(0) += 1;
    }
    counts
}
