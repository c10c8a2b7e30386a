use crate::output::{fmt_time, print_json, print_table};
use clap::Subcommand;
use preview_core::task::{generate_task_id, validate_task_id, Task};
use preview_core::types::Platform;
use std::path::Path;

#[derive(Subcommand)]
pub enum TaskSubcommand {
    /// Create a task; bundler platforms get a container right away
    Create {
        /// Owning user id
        #[arg(long)]
        user: String,
        /// web, mobile, ios or android
        #[arg(long)]
        platform: String,
        /// Task id (default: generated)
        #[arg(long)]
        id: Option<String>,
        /// Preview URL for tasks that do not run a bundler container
        #[arg(long)]
        sandbox_url: Option<String>,
    },

    /// List tasks
    List {
        /// Only tasks owned by this user
        #[arg(long)]
        user: Option<String>,
    },

    /// Delete a task and stop its container
    Delete { id: String },
}

pub fn run(root: &Path, subcmd: TaskSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        TaskSubcommand::Create {
            user,
            platform,
            id,
            sandbox_url,
        } => create(root, &user, &platform, id, sandbox_url, json),
        TaskSubcommand::List { user } => list(root, user.as_deref(), json),
        TaskSubcommand::Delete { id } => delete(root, &id, json),
    }
}

// ---------------------------------------------------------------------------
// create
// ---------------------------------------------------------------------------

fn create(
    root: &Path,
    user: &str,
    platform: &str,
    id: Option<String>,
    sandbox_url: Option<String>,
    json: bool,
) -> anyhow::Result<()> {
    let platform: Platform = platform.parse()?;
    let id = id.unwrap_or_else(generate_task_id);
    validate_task_id(&id)?;

    let state = super::open_state(root)?;
    let mut task = Task::new(&id, user, platform);
    task.sandbox_url = sandbox_url;
    state.store.insert_task(&task)?;

    let provisioned = if platform.needs_bundler() {
        let lifecycle = state.lifecycle.clone();
        let (tid, uid) = (id.clone(), user.to_string());
        Some(super::block_on(async move {
            Ok(lifecycle.provision_container(&tid, &uid, true).await?)
        })?)
    } else {
        None
    };

    if json {
        print_json(&serde_json::json!({ "task": task, "container": provisioned }))?;
    } else {
        println!("Created task '{id}' ({platform}) for {user}");
        if let Some(p) = provisioned {
            println!("Container {} is {} at {}", p.container_id, p.status, p.metro_url);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// list
// ---------------------------------------------------------------------------

fn list(root: &Path, user: Option<&str>, json: bool) -> anyhow::Result<()> {
    let state = super::open_state(root)?;
    let tasks = state.store.list_tasks(user)?;

    if json {
        print_json(&tasks)?;
        return Ok(());
    }
    if tasks.is_empty() {
        println!("No tasks.");
        return Ok(());
    }
    let rows = tasks
        .into_iter()
        .map(|t| {
            vec![
                t.id,
                t.user_id,
                t.platform.to_string(),
                t.status.to_string(),
                fmt_time(Some(t.created_at)),
            ]
        })
        .collect();
    print_table(&["ID", "USER", "PLATFORM", "STATUS", "CREATED"], rows);
    Ok(())
}

// ---------------------------------------------------------------------------
// delete
// ---------------------------------------------------------------------------

fn delete(root: &Path, id: &str, json: bool) -> anyhow::Result<()> {
    let state = super::open_state(root)?;
    let task = state.store.soft_delete_task(id, "", true)?;
    let lifecycle = state.lifecycle.clone();
    let tid = task.id.clone();
    let container = super::block_on(async move { Ok(lifecycle.teardown_task(&tid).await?) })?;

    if json {
        print_json(&serde_json::json!({
            "taskId": task.id,
            "deleted": true,
            "container": container,
        }))?;
    } else {
        println!("Deleted task '{}'", task.id);
        if let Some(c) = container {
            println!("Container {} is {}", c.container_id, c.status);
        }
    }
    Ok(())
}
