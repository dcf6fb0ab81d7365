//! cross-queue - Manage posts in the distribution queue
//!
//! Unix-style tool for drafting, scheduling, cancelling, and inspecting
//! posts handled by the cross-send daemon.

use clap::{Parser, Subcommand};
use std::sync::Arc;

use libcrosspost::platforms::registry::AdapterRegistry;
use libcrosspost::service::{EngineService, NewTarget};
use libcrosspost::timeparse::parse_schedule;
use libcrosspost::types::TargetOptions;
use libcrosspost::{Config, CrosspostError, Database, Result};

#[derive(Parser, Debug)]
#[command(name = "cross-queue")]
#[command(version)]
#[command(about = "Manage posts in the distribution queue")]
#[command(long_about = "\
cross-queue - Manage posts in the distribution queue

DESCRIPTION:
    cross-queue drafts, schedules, cancels, and inspects posts handled by
    the cross-send daemon. A post fans out to one target per destination
    account; each target is dispatched, retried, and tracked independently.

USAGE EXAMPLES:
    # Draft a post to two accounts
    cross-queue create --body \"Hello\" --account <ID> --account <ID>

    # Schedule it
    cross-queue schedule <POST_ID> \"tomorrow 3pm\"

    # Cancel before it dispatches
    cross-queue cancel <POST_ID>

    # Inspect status and analytics
    cross-queue status <POST_ID>
    cross-queue analytics <POST_ID> --format json

    # List scheduled posts
    cross-queue list --format json

CONFIGURATION:
    Configuration file: ~/.config/crosspost/config.toml
    Override with CROSSPOST_CONFIG.

EXIT CODES:
    0 - Success
    1 - Operation failed
    2 - Authentication error
    3 - Invalid input (bad post ID, time format, etc.)
    4 - Conflict (post already claimed by the dispatcher)
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a draft post
    Create {
        /// Post body
        #[arg(long)]
        body: String,

        /// Destination account id (repeatable)
        #[arg(long = "account", required = true)]
        accounts: Vec<String>,

        /// Media reference (repeatable, already uploaded)
        #[arg(long = "media")]
        media: Vec<String>,
    },

    /// Schedule a post
    Schedule {
        /// Post ID to schedule
        post_id: String,

        /// Schedule time (e.g. "tomorrow 3pm", "2h")
        time: String,
    },

    /// Cancel a scheduled post
    Cancel {
        /// Post ID to cancel
        post_id: String,
    },

    /// Show a post's status and per-target breakdown
    Status {
        /// Post ID to inspect
        post_id: String,

        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show engagement metrics for a post
    Analytics {
        /// Post ID to inspect
        post_id: String,

        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List scheduled posts
    List {
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Delete the external post behind a target
    Delete {
        /// Target ID whose external post should be deleted
        target_id: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Quiet by default; --verbose or CROSSPOST_LOG_LEVEL opens it up.
    libcrosspost::logging::init_from_env("error", cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    let db = Database::new(&config.database.path).await?;
    let registry = Arc::new(AdapterRegistry::with_defaults());
    let service = EngineService::new(db.clone(), registry, config);

    match cli.command {
        Commands::Create {
            body,
            accounts,
            media,
        } => cmd_create(&service, body, accounts, media).await,
        Commands::Schedule { post_id, time } => cmd_schedule(&service, &post_id, &time).await,
        Commands::Cancel { post_id } => cmd_cancel(&service, &post_id).await,
        Commands::Status { post_id, format } => cmd_status(&service, &post_id, &format).await,
        Commands::Analytics { post_id, format } => {
            cmd_analytics(&service, &post_id, &format).await
        }
        Commands::List { format } => cmd_list(&db, &format).await,
        Commands::Delete { target_id } => cmd_delete(&service, &target_id).await,
    }
}

fn validate_format(format: &str) -> Result<()> {
    if format != "text" && format != "json" {
        return Err(CrosspostError::InvalidInput(format!(
            "Invalid format '{}'. Must be 'text' or 'json'",
            format
        )));
    }
    Ok(())
}

async fn cmd_create(
    service: &EngineService,
    body: String,
    accounts: Vec<String>,
    media: Vec<String>,
) -> Result<()> {
    let destinations = accounts
        .into_iter()
        .map(|account_id| NewTarget {
            account_id,
            content_override: None,
            options: TargetOptions::new(),
        })
        .collect();

    let post = service.create_draft(body, media, destinations).await?;
    println!("{}", post.id);
    Ok(())
}

async fn cmd_schedule(service: &EngineService, post_id: &str, time: &str) -> Result<()> {
    let when = parse_schedule(time)?;
    service.schedule_post(post_id, when.timestamp()).await?;
    println!("Scheduled {} for {}", post_id, when.to_rfc3339());
    Ok(())
}

async fn cmd_cancel(service: &EngineService, post_id: &str) -> Result<()> {
    service.cancel_post(post_id).await?;
    println!("Cancelled {}", post_id);
    Ok(())
}

async fn cmd_status(service: &EngineService, post_id: &str, format: &str) -> Result<()> {
    validate_format(format)?;
    let view = service.get_post_status(post_id).await?;

    if format == "json" {
        let targets: Vec<serde_json::Value> = view
            .targets
            .iter()
            .map(|t| {
                serde_json::json!({
                    "id": t.id,
                    "account_id": t.account_id,
                    "platform": t.platform,
                    "status": t.status.as_str(),
                    "retry_count": t.retry_count,
                    "platform_post_id": t.platform_post_id,
                    "platform_post_url": t.platform_post_url,
                    "last_error": t.last_error,
                })
            })
            .collect();

        let out = serde_json::json!({
            "id": view.post.id,
            "status": view.post.status.as_str(),
            "scheduled_at": view.post.scheduled_at,
            "posted_at": view.post.posted_at,
            "last_error": view.post.last_error,
            "targets": targets,
        });
        println!("{}", serde_json::to_string_pretty(&out).unwrap_or_default());
    } else {
        println!("Post:      {}", view.post.id);
        println!("Status:    {}", view.post.status.as_str());
        if let Some(ts) = view.post.scheduled_at {
            println!("Scheduled: {}", format_timestamp(ts));
        }
        if let Some(error) = &view.post.last_error {
            println!("Error:     {}", error);
        }
        println!();
        for target in &view.targets {
            println!(
                "  [{}] {} -> {} (retries: {}){}",
                target.status.as_str(),
                target.platform,
                target
                    .platform_post_url
                    .as_deref()
                    .or(target.platform_post_id.as_deref())
                    .unwrap_or("-"),
                target.retry_count,
                target
                    .last_error
                    .as_deref()
                    .map(|e| format!(" error: {}", e))
                    .unwrap_or_default()
            );
        }
    }

    Ok(())
}

async fn cmd_analytics(service: &EngineService, post_id: &str, format: &str) -> Result<()> {
    validate_format(format)?;
    let analytics = service.get_analytics(post_id).await?;

    if format == "json" {
        let out: Vec<serde_json::Value> = analytics
            .iter()
            .map(|a| {
                serde_json::json!({
                    "target_id": a.target_id,
                    "platform": a.platform,
                    "latest": a.latest.as_ref().map(|(ts, m)| serde_json::json!({
                        "captured_at": ts,
                        "likes": m.likes,
                        "shares": m.shares,
                        "replies": m.replies,
                        "impressions": m.impressions,
                    })),
                    "snapshots": a.history.len(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out).unwrap_or_default());
    } else {
        for a in &analytics {
            match &a.latest {
                Some((ts, m)) => println!(
                    "{} ({}): {} likes, {} shares, {} replies, {} impressions (as of {}, {} snapshots)",
                    a.target_id,
                    a.platform,
                    m.likes,
                    m.shares,
                    m.replies,
                    m.impressions,
                    format_timestamp(*ts),
                    a.history.len()
                ),
                None => println!("{} ({}): no metrics captured yet", a.target_id, a.platform),
            }
        }
    }

    Ok(())
}

async fn cmd_list(db: &Database, format: &str) -> Result<()> {
    validate_format(format)?;
    let posts = db.scheduled_posts().await?;

    if format == "json" {
        let out: Vec<serde_json::Value> = posts
            .iter()
            .map(|p| {
                serde_json::json!({
                    "id": p.id,
                    "body": p.body,
                    "scheduled_at": p.scheduled_at,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out).unwrap_or_default());
    } else if posts.is_empty() {
        println!("No scheduled posts");
    } else {
        for post in &posts {
            let preview: String = post.body.chars().take(50).collect();
            println!(
                "{}  {}  {}",
                post.id,
                post.scheduled_at
                    .map(format_timestamp)
                    .unwrap_or_else(|| "-".to_string()),
                preview
            );
        }
    }

    Ok(())
}

async fn cmd_delete(service: &EngineService, target_id: &str) -> Result<()> {
    let outcome = service.delete_remote(target_id).await?;
    println!("Deleted ({:?})", outcome);
    Ok(())
}

fn format_timestamp(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| ts.to_string())
}
