//! bandtrack-admin - operator CLI for a Bandtrack database
//!
//! Resolves the root folder, opens (creating or migrating) the database and
//! runs one registry or membership command. Results are printed as JSON.

use anyhow::{bail, Context, Result};
use bandtrack_core::agenda::agenda;
use bandtrack_core::config::{RootFolderInitializer, RootFolderResolver, TomlConfig};
use bandtrack_core::db::init_database;
use bandtrack_core::groups::{create_group, groups_for_user, rotate_invitation_code};
use bandtrack_core::identity::{find_user_by_handle, register_user};
use bandtrack_core::membership::{join_group, list_members};
use bandtrack_core::performances::performance_setlist;
use bandtrack_core::time::parse_date;
use bandtrack_core::{Actor, GroupId, UserId};
use clap::{Parser, Subcommand};
use serde::Serialize;
use sqlx::SqlitePool;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "bandtrack-admin")]
#[command(about = "Operator tool for Bandtrack groups and members")]
#[command(version)]
struct Args {
    /// Root folder holding the database (overrides environment and config file)
    #[arg(short, long)]
    root_folder: Option<PathBuf>,

    /// Config file to use instead of the platform default location
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register a user; the first user becomes account admin
    Register {
        handle: String,
        /// Opaque credential material, stored as given
        #[arg(long)]
        credential: String,
    },
    /// Create a group owned by an existing user
    CreateGroup {
        /// Handle of the owner
        #[arg(long)]
        owner: String,
        name: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        logo_url: Option<String>,
    },
    /// Join a group by invitation code
    Join {
        handle: String,
        code: String,
        #[arg(long)]
        nickname: Option<String>,
    },
    /// List the groups a user belongs to, with their role in each
    Groups { handle: String },
    /// List the members of a group, as seen by one of them
    Members {
        #[arg(long = "as")]
        as_handle: String,
        group_id: GroupId,
    },
    /// Replace a group's invitation code (group admin)
    RotateCode {
        #[arg(long = "as")]
        as_handle: String,
        group_id: GroupId,
    },
    /// Show a performance setlist, dangling entries included
    Setlist {
        #[arg(long = "as")]
        as_handle: String,
        group_id: GroupId,
        performance_id: i64,
    },
    /// List rehearsal events and performances by date
    Agenda {
        #[arg(long = "as")]
        as_handle: String,
        group_id: GroupId,
        /// First day included, YYYY-MM-DD
        #[arg(long)]
        from: Option<String>,
        /// Last day included, YYYY-MM-DD
        #[arg(long)]
        to: Option<String>,
    },
}

fn init_tracing(config: &TomlConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    match &config.logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => {
            // stdout carries the JSON results
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

async fn user_id(pool: &SqlitePool, handle: &str) -> Result<UserId> {
    match find_user_by_handle(pool, handle).await? {
        Some(user) => Ok(user.id),
        None => bail!("No user with handle '{}'", handle),
    }
}

async fn actor(pool: &SqlitePool, handle: &str, group_id: GroupId) -> Result<Actor> {
    Ok(Actor::new(user_id(pool, handle).await?, group_id))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(pool: &SqlitePool, command: Command) -> Result<()> {
    match command {
        Command::Register { handle, credential } => {
            let user = register_user(pool, &handle, &credential).await?;
            print_json(&user)
        }
        Command::CreateGroup {
            owner,
            name,
            description,
            logo_url,
        } => {
            let owner_id = user_id(pool, &owner).await?;
            let group = create_group(pool, owner_id, &name, description.as_deref(), logo_url.as_deref()).await?;
            print_json(&group)
        }
        Command::Join { handle, code, nickname } => {
            let id = user_id(pool, &handle).await?;
            let member = join_group(pool, id, &code, nickname.as_deref()).await?;
            print_json(&member)
        }
        Command::Groups { handle } => {
            let id = user_id(pool, &handle).await?;
            print_json(&groups_for_user(pool, id).await?)
        }
        Command::Members { as_handle, group_id } => {
            let actor = actor(pool, &as_handle, group_id).await?;
            print_json(&list_members(pool, &actor).await?)
        }
        Command::RotateCode { as_handle, group_id } => {
            let actor = actor(pool, &as_handle, group_id).await?;
            let code = rotate_invitation_code(pool, &actor).await?;
            print_json(&serde_json::json!({ "group_id": group_id, "invitation_code": code }))
        }
        Command::Setlist {
            as_handle,
            group_id,
            performance_id,
        } => {
            let actor = actor(pool, &as_handle, group_id).await?;
            print_json(&performance_setlist(pool, &actor, performance_id).await?)
        }
        Command::Agenda {
            as_handle,
            group_id,
            from,
            to,
        } => {
            let actor = actor(pool, &as_handle, group_id).await?;
            let start = from.as_deref().map(parse_date).transpose()?;
            let end = to.as_deref().map(parse_date).transpose()?;
            print_json(&agenda(pool, &actor, start, end).await?)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let resolver = RootFolderResolver::new("bandtrack-admin")
        .with_cli_arg(args.root_folder.clone())
        .with_config_file(args.config.clone());
    let config = resolver.config();

    init_tracing(&config)?;

    info!(
        "Starting Bandtrack admin (bandtrack-admin) v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );

    let root_folder = resolver.resolve();
    let initializer = RootFolderInitializer::new(root_folder).with_database_config(&config.database);
    initializer.ensure_directory_exists()?;

    let db_path = initializer.database_path();
    info!("Database path: {}", db_path.display());

    let pool = match init_database(&db_path).await {
        Ok(pool) => pool,
        Err(e) => {
            error!("Failed to initialize database: {}", e);
            return Err(e.into());
        }
    };

    let result = run(&pool, args.command).await;
    pool.close().await;
    result
}
