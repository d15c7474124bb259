use docbridge_core::paths;
use std::path::Path;

pub fn run(root: &Path, tail: usize) -> anyhow::Result<()> {
    let path = paths::log_path(root);
    if !path.exists() {
        println!("no processing log yet (run 'docbridge process')");
        return Ok(());
    }

    let content = std::fs::read_to_string(&path)?;
    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(tail);
    for line in &lines[start..] {
        println!("{line}");
    }
    Ok(())
}
