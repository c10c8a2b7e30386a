use crate::output::print_json;
use anyhow::Context;
use clap::Subcommand;
use preview_core::config::Config;
use preview_server::auth::SessionKeys;
use std::path::Path;

#[derive(Subcommand)]
pub enum TokenSubcommand {
    /// Issue a bearer token for the API
    Issue {
        /// User id the token authenticates as
        #[arg(long)]
        user: String,
        /// Grant admin access (bypasses task ownership checks)
        #[arg(long)]
        admin: bool,
        /// Lifetime in hours
        #[arg(long, default_value = "24")]
        ttl_hours: i64,
    },
}

pub fn run(root: &Path, subcmd: TokenSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        TokenSubcommand::Issue {
            user,
            admin,
            ttl_hours,
        } => issue(root, &user, admin, ttl_hours, json),
    }
}

fn issue(root: &Path, user: &str, admin: bool, ttl_hours: i64, json: bool) -> anyhow::Result<()> {
    if ttl_hours <= 0 {
        anyhow::bail!("--ttl-hours must be positive");
    }
    let config = Config::load(root).context("failed to load config")?;
    let secret = config.server.session_secret.as_deref().context(
        "server.session_secret is not set; add it to .preview/config.yaml or set PREVIEW_SESSION_SECRET",
    )?;

    let token = SessionKeys::new(secret).issue(user, admin, chrono::Duration::hours(ttl_hours));

    if json {
        print_json(&serde_json::json!({
            "token": token,
            "user": user,
            "admin": admin,
            "ttlHours": ttl_hours,
        }))?;
    } else {
        println!("{token}");
    }
    Ok(())
}
