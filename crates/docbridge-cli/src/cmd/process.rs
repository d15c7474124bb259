use crate::output::print_json;
use docbridge_core::types::BatchSummary;
use std::path::Path;
use std::sync::Arc;

pub fn run(
    root: &Path,
    dry_run: bool,
    retry_failed: bool,
    fetch_first: bool,
    item: Option<u64>,
    json: bool,
) -> anyhow::Result<()> {
    let (orchestrator, config) = super::build(root, dry_run, true)?;
    let effective_dry_run = dry_run || config.dry_run;

    let runtime = tokio::runtime::Runtime::new()?;
    let summary = runtime.block_on(async {
        // First Ctrl-C finishes in-flight items and stops cleanly.
        let canceller = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("cancellation requested, finishing in-flight items");
                canceller.cancel();
            }
        });

        if retry_failed {
            let reset = orchestrator.reset_failed()?;
            if reset > 0 {
                println!("reset {reset} failed items");
            }
        }
        if fetch_first {
            orchestrator.fetch().await?;
        }
        match item {
            Some(id) => orchestrator.process_one(id).await,
            None => orchestrator.process_batch().await,
        }
    })?;

    if json {
        print_json(&summary)?;
    } else {
        print_summary(&summary, effective_dry_run);
    }
    Ok(())
}

fn print_summary(summary: &BatchSummary, dry_run: bool) {
    if dry_run {
        println!("dry run: no issues were created, no work items were touched\n");
    }
    println!("processed:             {}", summary.processed);
    println!("linked:                {}", summary.linked);
    println!("skipped:               {}", summary.skipped);
    println!("unresolved:            {}", summary.unresolved);
    println!("failed:                {}", summary.failed);
    println!("duplicates suppressed: {}", summary.duplicates_suppressed);
}
