use std::path::PathBuf;

use anyhow::Context;
use camrec_muxer::{SessionAttr, ThumbnailBox};
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod record;

#[derive(Parser)]
#[command(name = "camrec", about = "Record synthetic camera streams through the muxer")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record synthetic frames into split output files
    Record(record::RecordArgs),
    /// Show the thumbnail box embedded at the end of a recorded file
    Inspect { file: PathBuf },
    /// Print a session config for a single 1080p camera
    SampleConfig {
        #[arg(long, default_value_t = 0)]
        camera_id: u32,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Record(args) => args.run(),
        Commands::Inspect { file } => inspect(&file),
        Commands::SampleConfig { camera_id } => {
            let attr = SessionAttr::sample(camera_id);
            println!("{}", serde_json::to_string_pretty(&attr)?);
            Ok(())
        }
    }
}

fn inspect(file: &std::path::Path) -> anyhow::Result<()> {
    let bytes =
        std::fs::read(file).with_context(|| format!("Failed to read '{}'", file.display()))?;

    let thumbnail = ThumbnailBox::find_last(&bytes).map(|(offset, thumbnail)| {
        serde_json::json!({
            "offset": offset,
            "params": thumbnail.params,
            "payloadBytes": thumbnail.payload.len(),
        })
    });

    let summary = serde_json::json!({
        "path": file,
        "size": bytes.len(),
        "thumbnail": thumbnail,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    Ok(())
}
