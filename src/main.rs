//! Mergeline binary entry point

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mergeline::api::{NormalizedMessage, NormalizedUser};
use mergeline::data::{Column, ColumnSet, NewOrigin, TimelineKind, TimelineRequest, UserChanges};
use mergeline::storage::ChannelDownloadQueue;
use mergeline::{AppState, config};

#[derive(Parser, Debug)]
#[command(name = "mergeline")]
#[command(about = "Merge timelines from many social-network origins into one store")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage origins
    Origin {
        #[command(subcommand)]
        command: OriginCommand,
    },
    /// Manage local accounts
    Account {
        #[command(subcommand)]
        command: AccountCommand,
    },
    /// Ingest a JSON file of normalized records under an account
    Ingest {
        #[arg(long)]
        origin: String,
        #[arg(long)]
        account: String,
        #[arg(long, default_value = "home")]
        timeline: TimelineKind,
        /// File holding a JSON array of messages (or users with --users)
        #[arg(long)]
        file: PathBuf,
        #[arg(long, default_value_t = false)]
        users: bool,
        /// Dump Prometheus metrics to stderr when done
        #[arg(long, default_value_t = false)]
        print_metrics: bool,
    },
    /// Print a timeline as JSON lines
    Timeline {
        #[arg(long)]
        origin: String,
        #[arg(long)]
        account: Option<String>,
        #[arg(long, default_value = "home")]
        kind: TimelineKind,
        /// Subject of a user timeline
        #[arg(long)]
        user_id: Option<i64>,
        /// Extra columns, e.g. author_name,sender_name
        #[arg(long, value_delimiter = ',')]
        columns: Vec<Column>,
        #[arg(long, default_value_t = 40)]
        limit: u32,
        #[arg(long)]
        older_than: Option<i64>,
    },
    /// Report whether a timeline is due for automatic sync
    SyncStatus {
        #[arg(long)]
        origin: String,
        #[arg(long)]
        account: String,
        #[arg(long, default_value = "home")]
        timeline: TimelineKind,
    },
    /// List downloads still waiting to be fetched
    PendingDownloads {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
}

#[derive(Subcommand, Debug)]
enum OriginCommand {
    Add {
        #[arg(long)]
        name: String,
        #[arg(long = "type")]
        origin_type: String,
        #[arg(long)]
        url: String,
        #[arg(long, default_value_t = false)]
        no_ssl: bool,
        #[arg(long, default_value_t = false)]
        allow_html: bool,
        #[arg(long, default_value_t = 0)]
        text_limit: i64,
    },
    List,
}

#[derive(Subcommand, Debug)]
enum AccountCommand {
    Add {
        #[arg(long)]
        origin: String,
        #[arg(long)]
        username: String,
        #[arg(long)]
        remote_id: Option<String>,
    },
}

/// Application entry point
///
/// # Setup
/// 1. Initialize tracing/logging
/// 2. Load configuration from file and environment
/// 3. Initialize AppState
/// 4. Run the requested command
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // 1. Initialize tracing/logging
    let log_format =
        std::env::var("MERGELINE__LOGGING__FORMAT").unwrap_or_else(|_| "pretty".to_string());

    if log_format == "json" {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "mergeline=info,sqlx=warn".into()),
            )
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "mergeline=info,sqlx=warn".into()),
            )
            .with(tracing_subscriber::fmt::layer().pretty().with_writer(std::io::stderr))
            .init();
    }

    mergeline::metrics::init_metrics();

    // 2. Load configuration
    let config = config::AppConfig::load()?;
    tracing::info!(
        database = %config.database.path.display(),
        "Configuration loaded"
    );

    // 3. Initialize application state
    let (downloads, mut pending) = ChannelDownloadQueue::new(config.downloads.queue_capacity);
    let state = AppState::new(config, Arc::new(downloads)).await?;

    // 4. Run command
    match cli.command {
        Commands::Origin { command } => run_origin(&state, command).await?,
        Commands::Account { command } => run_account(&state, command).await?,
        Commands::Ingest {
            origin,
            account,
            timeline,
            file,
            users,
            print_metrics,
        } => {
            let account = state.account(&origin, &account).await?;
            let ctx = state.ingest_context(account, timeline);
            let raw = tokio::fs::read_to_string(&file).await?;
            let sync = state.timeline_sync();
            let report = if users {
                let records: Vec<NormalizedUser> = serde_json::from_str(&raw)?;
                sync.ingest_users(&ctx, &records).await?
            } else {
                let records: Vec<NormalizedMessage> = serde_json::from_str(&raw)?;
                sync.ingest_messages(&ctx, &records).await?
            };

            // No coordinator runs in the CLI; report what it would have received
            let mut queued = 0usize;
            while pending.try_recv().is_ok() {
                queued += 1;
            }
            println!("{}", serde_json::to_string(&report)?);
            tracing::info!(queued, "Downloads handed off");
            if print_metrics {
                eprint!("{}", mergeline::metrics::gather_text()?);
            }
        }
        Commands::Timeline {
            origin,
            account,
            kind,
            user_id,
            columns,
            limit,
            older_than,
        } => {
            let origin_id = state
                .db
                .get_origin_by_name(&origin)
                .await?
                .ok_or(mergeline::error::AppError::NotFound)?
                .id;
            let mut request = TimelineRequest::new(kind)
                .with_columns(columns.into_iter().collect::<ColumnSet>())
                .limit(limit);
            // Everything is scoped to the origin by its own base table
            request = request.at_origin(origin_id);
            if let Some(username) = account {
                request = request.for_account(state.account(&origin, &username).await?.user_id);
            }
            if let Some(user_id) = user_id {
                request = request.of_user(user_id);
            }
            if let Some(older_than) = older_than {
                request = request.older_than(older_than);
            }

            for row in state.timeline_service().load(request).await? {
                println!("{}", serde_json::to_string(&row)?);
            }
        }
        Commands::SyncStatus {
            origin,
            account,
            timeline,
        } => {
            let account = state.account(&origin, &account).await?;
            let ctx = state.ingest_context(account, timeline);
            let due = state
                .timeline_sync()
                .is_due(&ctx, state.config.sync.auto_sync_interval())
                .await?;
            println!("{}", if due { "due" } else { "up-to-date" });
        }
        Commands::PendingDownloads { limit } => {
            for download in state.db.get_pending_downloads(limit).await? {
                println!("{}", serde_json::to_string(&download)?);
            }
        }
    }

    Ok(())
}

async fn run_origin(state: &AppState, command: OriginCommand) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        OriginCommand::Add {
            name,
            origin_type,
            url,
            no_ssl,
            allow_html,
            text_limit,
        } => {
            url::Url::parse(&url)?;
            let id = state
                .db
                .insert_origin(&NewOrigin {
                    origin_type,
                    name: name.clone(),
                    url,
                    ssl: !no_ssl,
                    allow_html,
                    text_limit,
                })
                .await?;
            tracing::info!(origin_id = id, name = %name, "Origin added");
            println!("{id}");
        }
        OriginCommand::List => {
            for origin in state.db.get_origins().await? {
                println!("{}", serde_json::to_string(&origin)?);
            }
        }
    }
    Ok(())
}

async fn run_account(state: &AppState, command: AccountCommand) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        AccountCommand::Add {
            origin,
            username,
            remote_id,
        } => {
            let origin = state
                .db
                .get_origin_by_name(&origin)
                .await?
                .ok_or(mergeline::error::AppError::NotFound)?;
            let id = state
                .db
                .insert_user(&UserChanges {
                    origin_id: Some(origin.id),
                    remote_id,
                    username: Some(username.clone()),
                    ..Default::default()
                })
                .await?;
            tracing::info!(user_id = id, username = %username, "Account added");
            println!("{id}");
        }
    }
    Ok(())
}
