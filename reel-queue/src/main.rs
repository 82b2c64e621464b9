//! reel-queue - Manage video posts
//!
//! Unix-style tool for drafting, scheduling and publishing posts from the
//! command line.

use anyhow::{bail, Context};
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use libreelcast::db::PostWithPlatforms;
use libreelcast::logging::LoggingConfig;
use libreelcast::scheduling::parse_future_schedule;
use libreelcast::service::analytics::{AnalyticsOverview, SyncOutcome, SyncReport};
use libreelcast::service::posts::QueueEntry;
use libreelcast::service::{Outcome, PublishReport, ReelcastService};
use libreelcast::types::{Asset, Platform, PostContext};
use libreelcast::{PostStatus, ReelcastError};
use tracing::debug;

#[derive(Parser, Debug)]
#[command(name = "reel-queue")]
#[command(version)]
#[command(about = "Manage video posts")]
#[command(long_about = "\
reel-queue - Manage video posts

DESCRIPTION:
    reel-queue is a Unix-style tool for managing Reelcast posts: create
    drafts, pick captions, schedule, cancel, publish immediately and retry
    failed platforms.

COMMANDS:
    draft     Create a draft post for one or more platforms
    caption   Set the caption published on one platform
    list      List upcoming and in-flight posts
    show      Show one post and its platform sub-posts
    schedule  Schedule a post
    cancel    Cancel a post
    delete    Delete a post
    now       Publish a post immediately
    retry     Retry failed platforms
    stats     Show engagement totals, optionally syncing them first

USAGE EXAMPLES:
    # Draft a post for Instagram and TikTok
    reel-queue --user me draft --video-url https://cdn.example.com/v.mp4 \\
        --platform instagram --platform tiktok

    # Schedule it
    reel-queue --user me schedule <POST_ID> \"tomorrow 3pm\" --timezone Europe/Berlin

    # Publish right away, printing the per-platform results as JSON
    reel-queue --user me now <POST_ID> --format json

    # Retry only TikTok
    reel-queue --user me retry <POST_ID> --platform tiktok

    # Fetch fresh metrics for every published video, then show totals
    reel-queue --user me stats --sync

CONFIGURATION:
    Configuration file: ~/.config/reelcast/config.toml
    Database location: ~/.local/share/reelcast/reelcast.db

    Override with environment variables:
        REELCAST_CONFIG    - Path to config file
        REELCAST_DB_PATH   - Path to database file
        REELCAST_USER      - Default for --user

EXIT CODES:
    0 - Success
    1 - Operation failed (e.g. every platform failed to publish)
    2 - Database or configuration error
    3 - Invalid input (bad post ID, time format, etc.)
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// User whose posts are managed
    #[arg(short, long, global = true, env = "REELCAST_USER")]
    user: Option<String>,

    /// Enable verbose logging to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a draft post
    Draft {
        /// Public URL of the video to publish
        #[arg(long, conflicts_with = "asset")]
        video_url: Option<String>,

        /// ID of an already uploaded asset
        #[arg(long)]
        asset: Option<String>,

        /// MIME type of --video-url, checked against each platform
        #[arg(long, requires = "video_url")]
        mime_type: Option<String>,

        /// Target platform (repeatable)
        #[arg(short, long = "platform", required = true)]
        platforms: Vec<Platform>,

        /// Topic recorded with the post
        #[arg(long)]
        topic: Option<String>,
    },

    /// Set the caption for one platform
    Caption {
        post_id: String,
        platform: Platform,
        caption: String,
    },

    /// List upcoming and in-flight posts
    List {
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,

        /// Only posts targeting this platform
        #[arg(short, long)]
        platform: Option<Platform>,
    },

    /// Show a post and its platform sub-posts
    Show {
        post_id: String,

        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Schedule a post
    Schedule {
        post_id: String,

        /// When to publish (e.g. "tomorrow 3pm", "2h", RFC 3339)
        time: String,

        /// IANA timezone recorded with the schedule
        #[arg(long)]
        timezone: Option<String>,
    },

    /// Cancel a post
    Cancel { post_id: String },

    /// Delete a post
    Delete { post_id: String },

    /// Publish immediately
    Now {
        post_id: String,

        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Retry failed platforms
    Retry {
        post_id: String,

        /// Only retry these platforms (repeatable)
        #[arg(short, long = "platform")]
        platforms: Vec<Platform>,

        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Show engagement totals
    Stats {
        /// Fetch fresh metrics from the platforms first
        #[arg(long)]
        sync: bool,

        /// Only sync these platform sub-posts (repeatable)
        #[arg(long = "sub-post", requires = "sync")]
        sub_posts: Vec<String>,

        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    LoggingConfig::from_env(cli.verbose)
        .with_level("error".to_string())
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(exit_code(&e));
    }
}

fn exit_code(error: &anyhow::Error) -> i32 {
    error
        .downcast_ref::<ReelcastError>()
        .map(ReelcastError::exit_code)
        .unwrap_or(1)
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let Some(user) = cli.user else {
        return Err(ReelcastError::InvalidInput(
            "No user given. Pass --user or set REELCAST_USER".to_string(),
        )
        .into());
    };

    let service = ReelcastService::new().await?;
    debug!(user = %user, command = ?cli.command, "running command");

    match cli.command {
        Commands::Draft {
            video_url,
            asset,
            mime_type,
            platforms,
            topic,
        } => {
            let source = match (video_url, asset) {
                (Some(url), _) => VideoSource::Url { url, mime_type },
                (None, asset) => VideoSource::Asset(asset),
            };
            cmd_draft(&service, &user, source, &platforms, topic).await
        }
        Commands::Caption {
            post_id,
            platform,
            caption,
        } => {
            service
                .posts()
                .select_caption(&post_id, &user, platform, &caption)
                .await?;
            println!("Caption set for {}", platform);
            Ok(())
        }
        Commands::List { format, platform } => cmd_list(&service, &user, format, platform).await,
        Commands::Show { post_id, format } => {
            let post = service.posts().get(&post_id, &user).await?;
            match format {
                OutputFormat::Json => print_json(&post),
                OutputFormat::Text => {
                    output_show_text(&post);
                    Ok(())
                }
            }
        }
        Commands::Schedule {
            post_id,
            time,
            timezone,
        } => {
            let at = parse_future_schedule(&time, Utc::now())?;
            service
                .posts()
                .schedule(&post_id, &user, at.timestamp(), timezone.as_deref())
                .await?;
            println!("Scheduled {} for {}", post_id, at.to_rfc3339());
            Ok(())
        }
        Commands::Cancel { post_id } => {
            service.posts().cancel(&post_id, &user).await?;
            println!("Canceled {}", post_id);
            Ok(())
        }
        Commands::Delete { post_id } => {
            service.posts().delete(&post_id, &user).await?;
            println!("Deleted {}", post_id);
            Ok(())
        }
        Commands::Now { post_id, format } => {
            let report = service.publishing().publish_now(&post_id, &user).await?;
            output_report(&report, format)
        }
        Commands::Retry {
            post_id,
            platforms,
            format,
        } => {
            let only = (!platforms.is_empty()).then_some(platforms.as_slice());
            let report = service.publishing().retry(&post_id, &user, only).await?;
            output_report(&report, format)
        }
        Commands::Stats {
            sync,
            sub_posts,
            format,
        } => cmd_stats(&service, &user, sync, &sub_posts, format).await,
    }
}

enum VideoSource {
    Url {
        url: String,
        mime_type: Option<String>,
    },
    Asset(Option<String>),
}

async fn cmd_draft(
    service: &ReelcastService,
    user: &str,
    source: VideoSource,
    platforms: &[Platform],
    topic: Option<String>,
) -> anyhow::Result<()> {
    let asset_id = match source {
        VideoSource::Url { url, mime_type } => {
            let asset = Asset::new(user, Some(url), mime_type);
            service.database().create_asset(&asset).await?;
            Some(asset.id)
        }
        VideoSource::Asset(asset) => asset,
    };

    let context = PostContext {
        topic,
        ..PostContext::default()
    };
    let draft = service
        .posts()
        .create_draft(user, asset_id.as_deref(), context, platforms)
        .await?;

    println!("{}", draft.post.id);
    Ok(())
}

async fn cmd_list(
    service: &ReelcastService,
    user: &str,
    format: OutputFormat,
    platform: Option<Platform>,
) -> anyhow::Result<()> {
    let mut entries = service.posts().queue(user).await?;

    if let Some(platform) = platform {
        entries.retain(|entry| entry.platforms.iter().any(|(p, _)| *p == platform));
    }

    match format {
        OutputFormat::Json => print_json(&entries),
        OutputFormat::Text => {
            output_list_text(&entries);
            Ok(())
        }
    }
}

async fn cmd_stats(
    service: &ReelcastService,
    user: &str,
    sync: bool,
    sub_posts: &[String],
    format: OutputFormat,
) -> anyhow::Result<()> {
    let report = if sync {
        Some(service.analytics().sync(user, sub_posts).await?)
    } else {
        None
    };
    let overview = service.analytics().overview(user).await?;

    match format {
        OutputFormat::Json => print_json(&serde_json::json!({
            "sync": report,
            "overview": overview,
        })),
        OutputFormat::Text => {
            if let Some(report) = &report {
                output_sync_text(report);
            }
            output_overview_text(&overview);
            Ok(())
        }
    }
}

fn output_sync_text(report: &SyncReport) {
    for result in &report.results {
        if let SyncOutcome::Failed { error } = &result.outcome {
            println!("{} {}: {}", result.platform, result.platform_post_id, error);
        }
    }
    println!("Synced {} of {}", report.synced, report.total);
}

fn output_overview_text(overview: &AnalyticsOverview) {
    if overview.totals.posts == 0 {
        println!("No analytics yet");
        return;
    }

    let rate = |rate: Option<f64>| {
        rate.map(|r| format!("{:.2}%", r))
            .unwrap_or_else(|| "-".to_string())
    };
    println!(
        "{:<10} {:>6} {:>10} {:>8} {:>8} {:>8} {:>8}",
        "platform", "posts", "views", "likes", "comments", "shares", "rate"
    );
    for (platform, totals) in &overview.platforms {
        println!(
            "{:<10} {:>6} {:>10} {:>8} {:>8} {:>8} {:>8}",
            platform.as_str(),
            totals.posts,
            totals.views,
            totals.likes,
            totals.comments,
            totals.shares,
            rate(totals.engagement_rate)
        );
    }
    let totals = &overview.totals;
    println!(
        "{:<10} {:>6} {:>10} {:>8} {:>8} {:>8} {:>8}",
        "total",
        totals.posts,
        totals.views,
        totals.likes,
        totals.comments,
        totals.shares,
        rate(totals.engagement_rate)
    );
    if let Some(at) = overview.last_synced_at {
        println!("Last synced {}", format_timestamp(at));
    }
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to encode JSON output")?
    );
    Ok(())
}

fn output_list_text(entries: &[QueueEntry]) {
    let now = Utc::now().timestamp();

    for entry in entries {
        let platforms = entry
            .platforms
            .iter()
            .map(|(platform, status)| format!("{}:{}", platform, status))
            .collect::<Vec<_>>()
            .join(",");
        let time_until = entry
            .post
            .scheduled_for
            .map(|ts| format_time_until(now, ts))
            .unwrap_or_else(|| "unscheduled".to_string());

        println!(
            "{} | {} | {} | {}",
            entry.post.id, entry.post.status, platforms, time_until
        );
    }
}

fn output_show_text(post: &PostWithPlatforms) {
    println!("Post:    {}", post.post.id);
    println!("Status:  {}", post.post.status);
    if let Some(at) = post.post.scheduled_for {
        println!(
            "When:    {} ({})",
            format_timestamp(at),
            post.post.timezone.as_deref().unwrap_or("UTC")
        );
    }

    for sub in &post.platform_posts {
        let detail = match (&sub.external_url, &sub.last_error) {
            (Some(url), _) => url.clone(),
            (None, Some(error)) => error.clone(),
            (None, None) => sub.caption_final.as_deref().map(preview).unwrap_or_default(),
        };
        println!("  {:<10} {:<20} {}", sub.platform, sub.status, detail);
    }
}

fn output_report(report: &PublishReport, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => print_json(report)?,
        OutputFormat::Text => {
            for result in &report.results {
                match &result.outcome {
                    Outcome::Published { external_id, url } => println!(
                        "{}: published {}",
                        result.platform,
                        url.as_deref().unwrap_or(external_id)
                    ),
                    Outcome::Failed { error } => {
                        println!("{}: failed - {}", result.platform, error)
                    }
                    Outcome::Skipped { reason } => {
                        println!("{}: skipped - {}", result.platform, reason)
                    }
                }
            }
            println!("Post {} is {}", report.post_id, report.status);
        }
    }

    if report.status == PostStatus::Failed {
        bail!("No platform published post {}", report.post_id);
    }
    Ok(())
}

/// First line of a caption, cut to 40 characters
fn preview(caption: &str) -> String {
    let line = caption.lines().next().unwrap_or_default();
    if line.chars().count() <= 40 {
        line.to_string()
    } else {
        format!("{}...", line.chars().take(40).collect::<String>())
    }
}

fn format_timestamp(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| ts.to_string())
}

/// Format time until scheduled time in human-readable format
fn format_time_until(now: i64, scheduled_at: i64) -> String {
    let diff = scheduled_at - now;

    if diff < 0 {
        return "overdue".to_string();
    }

    let minutes = diff / 60;
    let hours = minutes / 60;
    let days = hours / 24;

    if days > 0 {
        format!("in {} day{}", days, if days == 1 { "" } else { "s" })
    } else if hours > 0 {
        format!("in {} hour{}", hours, if hours == 1 { "" } else { "s" })
    } else if minutes > 0 {
        format!("in {} minute{}", minutes, if minutes == 1 { "" } else { "s" })
    } else {
        "in <1 minute".to_string()
    }
}
