use crate::output::print_json;
use std::path::Path;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let state = super::open_state(root)?;
    let report = super::block_on(async move { Ok(state.lifecycle.reconcile().await?) })?;

    if json {
        print_json(&report)?;
        return Ok(());
    }

    println!("Orphans stopped:      {}", report.orphans_stopped.len());
    for id in &report.orphans_stopped {
        println!("  {id}");
    }
    println!("Candidates resolved:  {}", report.candidates_resolved);
    println!("Rows marked stopped:  {}", report.rows_marked_stopped.len());
    for id in &report.rows_marked_stopped {
        println!("  {id}");
    }
    if report.errors.is_empty() {
        println!("Reconciliation clean.");
    } else {
        for e in &report.errors {
            println!("[error] {e}");
        }
        anyhow::bail!("reconciliation finished with {} error(s)", report.errors.len());
    }
    Ok(())
}
