use crate::output::{fmt_time, print_json, print_table};
use clap::Subcommand;
use preview_core::container::RemoteContainer;
use std::path::Path;

const OPERATOR_STOP_REASON: &str = "stopped by operator";

#[derive(Subcommand)]
pub enum ContainersSubcommand {
    /// List container rows (active only unless --all)
    List {
        /// Include stopped and failed containers
        #[arg(long)]
        all: bool,
    },

    /// Poll the provider for one container and record the result
    Monitor {
        /// Provider container id
        container_id: String,
    },

    /// Stop a container
    Stop {
        /// Provider container id
        container_id: String,
    },
}

pub fn run(root: &Path, subcmd: ContainersSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        ContainersSubcommand::List { all } => list(root, all, json),
        ContainersSubcommand::Monitor { container_id } => monitor(root, &container_id, json),
        ContainersSubcommand::Stop { container_id } => stop(root, &container_id, json),
    }
}

fn row_cells(c: RemoteContainer) -> Vec<String> {
    let usage = c
        .resource_usage
        .map(|u| format!("{:.0}% / {:.0}MB", u.cpu, u.ram))
        .unwrap_or_else(|| "-".to_string());
    vec![
        c.container_id,
        c.task_id,
        c.status.to_string(),
        usage,
        c.metro_url,
        fmt_time(Some(c.last_activity_at)),
    ]
}

fn list(root: &Path, all: bool, json: bool) -> anyhow::Result<()> {
    let state = super::open_state(root)?;
    let rows = if all {
        state.store.list_containers()?
    } else {
        state.store.list_active_containers()?
    };

    if json {
        print_json(&rows)?;
        return Ok(());
    }
    if rows.is_empty() {
        println!("No containers.");
        return Ok(());
    }
    print_table(
        &["CONTAINER", "TASK", "STATUS", "CPU / RAM", "METRO URL", "LAST ACTIVITY"],
        rows.into_iter().map(row_cells).collect(),
    );
    Ok(())
}

fn monitor(root: &Path, container_id: &str, json: bool) -> anyhow::Result<()> {
    let state = super::open_state(root)?;
    let lifecycle = state.lifecycle.clone();
    let cid = container_id.to_string();
    let snap = super::block_on(async move { Ok(lifecycle.monitor_container(&cid).await?) })?;

    if json {
        print_json(&snap)?;
        return Ok(());
    }
    println!("Container:     {}", snap.container_id);
    println!("Status:        {}", snap.status);
    println!("CPU:           {:.1}%", snap.resource_usage.cpu);
    println!("RAM:           {:.0} MB", snap.resource_usage.ram);
    println!("Network:       {:.1} KB/s", snap.resource_usage.network);
    println!("Uptime:        {}s", snap.uptime_seconds);
    println!("Last activity: {}", fmt_time(Some(snap.last_activity_at)));
    if let Some(reason) = &snap.reason {
        println!("Reason:        {reason}");
    }
    Ok(())
}

fn stop(root: &Path, container_id: &str, json: bool) -> anyhow::Result<()> {
    let state = super::open_state(root)?;
    let lifecycle = state.lifecycle.clone();
    let cid = container_id.to_string();
    let snap = super::block_on(async move {
        Ok(lifecycle.stop_container(&cid, OPERATOR_STOP_REASON).await?)
    })?;

    if json {
        print_json(&snap)?;
    } else {
        println!("Container {} is {}", snap.container_id, snap.status);
    }
    Ok(())
}
