use crate::output::print_json;
use std::path::Path;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let (orchestrator, _config) = super::build(root, false, false)?;
    let runtime = tokio::runtime::Runtime::new()?;
    let ids = runtime.block_on(orchestrator.fetch())?;

    if json {
        print_json(&serde_json::json!({ "query_item_count": ids.len(), "ids": ids }))?;
    } else {
        println!("query returned {} work items", ids.len());
    }
    Ok(())
}
