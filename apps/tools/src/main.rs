use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use shared::{
    domain::{ConfidenceBand, VideoId},
    protocol::{ReviewStats, VideoDetail},
};
use storage::Storage;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/videos.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Lists videos in upload order.
    List {
        /// Only videos whose filename contains this text, ignoring case.
        #[arg(long)]
        filter: Option<String>,
    },
    /// Prints one video and its events.
    Show {
        video_id: String,
        /// Emit the full record as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Returns videos stuck in `analyzing` to `uploaded`.
    Recover {
        /// Leave analyses claimed more recently than this alone; a running server may
        /// still own them. Match the server's analysis timeout.
        #[arg(long, default_value_t = 300)]
        older_than_seconds: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::List { filter } => {
            let videos = storage.list_videos().await?.into_iter().filter(|video| {
                filter
                    .as_deref()
                    .map_or(true, |query| video.filename_matches(query))
            });
            for video in videos {
                let stats = ReviewStats::from_events(&video.events);
                println!(
                    "{}  {:<10} {:>8.1}s  events={} reviewed={}  {}",
                    video.id,
                    video.state,
                    video.duration_seconds,
                    stats.total,
                    stats.reviewed(),
                    video.filename
                );
            }
        }
        Command::Show { video_id, json } => {
            let video = storage.get_video(&VideoId::from(video_id.as_str())).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&VideoDetail::from(&video))?);
            } else {
                println!(
                    "{} {} ({}, {:.1}s, uploaded {})",
                    video.id, video.filename, video.state, video.duration_seconds, video.uploaded_at
                );
                for event in &video.events {
                    let review = match event.review.outcome() {
                        Some(outcome) => outcome.to_string(),
                        None => "unreviewed".to_string(),
                    };
                    println!(
                        "  {:>8.1}s  {:<10} {:.2} ({:?})  {}  {}",
                        event.timestamp,
                        event.event_type,
                        event.confidence,
                        ConfidenceBand::for_confidence(event.confidence),
                        review,
                        event.id
                    );
                }
            }
        }
        Command::Recover { older_than_seconds } => {
            let reverted = storage
                .revert_stalled_analyses(Duration::from_secs(older_than_seconds))
                .await?;
            if reverted.is_empty() {
                println!("no stalled analyses");
            }
            for video_id in reverted {
                println!("reverted {video_id} to uploaded");
            }
        }
    }

    Ok(())
}
