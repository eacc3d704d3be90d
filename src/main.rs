use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use anyhow::{bail, Context};
use clap::Parser;
use clipdrop::channel::ConfiguredTokenAuthorizer;
use clipdrop::core::FileOutcome;
use clipdrop::remote::HttpUploadService;
use clipdrop::utils::progress::{format_bytes, format_duration, format_speed};
use clipdrop::{logging, AppConfig, DispositionPolicy, Uploader};

/// Upload every finished clip in a folder.
#[derive(Debug, Parser)]
#[command(name = "clipdrop", version)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Folder to scan (not recursive)
    folder: PathBuf,

    /// Target channel id; defaults to the active channel
    #[arg(long)]
    channel: Option<String>,

    /// Refresh the channel list before uploading
    #[arg(long)]
    discover: bool,

    /// Leave source files in place after upload
    #[arg(long)]
    keep: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AppConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => AppConfig::default(),
    };
    logging::init(&config.logging);

    let service = Arc::new(HttpUploadService::from_config(&config.api).context("building http client")?);
    let authorizer = Arc::new(ConfiguredTokenAuthorizer::new(config.api.access_token.clone()));
    let uploader = Uploader::open(config, service, authorizer)
        .await
        .context("initializing uploader")?;

    if cli.discover || uploader.channels().channels().is_empty() {
        let channels = uploader.discover_channels().await.context("discovering channels")?;
        for channel in &channels {
            println!("channel {} ({})", channel.channel_id, channel.title);
        }
    }
    if let Some(channel) = &cli.channel {
        if uploader.channels().get_channel(channel).is_none() {
            bail!("unknown channel {}", channel);
        }
    }

    uploader.on_complete(|item| {
        let speed = item.upload_speed().map(format_speed).unwrap_or_default();
        let took = item
            .duration()
            .map(|secs| format_duration(Duration::from_secs_f64(secs.max(0.0))))
            .unwrap_or_default();
        println!("uploaded {} ({}) {} in {}", item.file_name, format_bytes(item.file_size), speed, took);
    });
    uploader.on_error(|item, kind, message| {
        eprintln!("failed {} [{}]: {}", item.file_name, kind, message);
    });

    let policy = cli.keep.then_some(DispositionPolicy::Keep);
    let summary = uploader
        .run_batch(&cli.folder, cli.channel.as_deref(), policy)
        .await
        .with_context(|| format!("uploading {}", cli.folder.display()));
    uploader.shutdown().await;
    let summary = summary?;

    for outcome in &summary.outcomes {
        match &outcome.outcome {
            FileOutcome::Uploaded { warning: Some(warning), .. } => {
                println!("warning {}: {}", outcome.file.display(), warning)
            }
            FileOutcome::Skipped(reason) => println!("skipped {}: {:?}", outcome.file.display(), reason),
            _ => {}
        }
    }
    println!(
        "uploaded={} skipped={} failed={}",
        summary.uploaded, summary.skipped, summary.failed
    );

    if summary.failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}
