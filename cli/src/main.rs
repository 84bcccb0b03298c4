use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use masks::Rle;
use savi::controller::{SessionEvent, StreamingState};
use savi::{ClientConfig, FrameSize, HttpSegmentationClient, Point, SessionController, spawn_session_worker};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("segmentation service: {0}")]
    Session(#[from] savi::SessionError),
    #[error("mask decode failed: {0}")]
    Codec(#[from] masks::CodecError),
    #[error("{operation} failed ({code}): {message}")]
    Remote { operation: &'static str, code: &'static str, message: String },
    #[error("session worker stopped unexpectedly")]
    WorkerStopped,
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "savi", about = "Interactive video segmentation client")]
struct Cli {
    /// Overrides `SAVI_BASE_URL` from the client config.
    #[arg(long, env = "SAVI_BASE_URL")]
    base_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check that the inference service is reachable.
    Ping,
    /// Prompt one object and propagate it across the video.
    Track(TrackArgs),
    /// Inspect a compressed RLE mask.
    Mask(MaskArgs),
}

#[derive(Args, Debug)]
struct TrackArgs {
    /// Video path as known to the service.
    video: String,

    #[arg(long)]
    width: u32,

    #[arg(long)]
    height: u32,

    /// Frame the prompts are placed on.
    #[arg(long, default_value_t = 0)]
    frame: u32,

    #[arg(long, default_value_t = 0)]
    object: u32,

    /// Prompt as `x,y` or `x,y,label` in pixels; label 1 is foreground, 0
    /// background. Repeatable.
    #[arg(long = "point", value_parser = parse_point, required = true)]
    points: Vec<Point>,

    #[arg(long, default_value_t = 0)]
    start_frame: u32,

    /// Also print full session snapshots.
    #[arg(long, default_value_t = false)]
    snapshots: bool,
}

#[derive(Args, Debug)]
struct MaskArgs {
    #[arg(long)]
    width: i64,

    #[arg(long)]
    height: i64,

    /// Compressed counts string.
    counts: String,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let cli = Cli::parse();
    let mut config = ClientConfig::from_env();
    if let Some(base_url) = cli.base_url {
        config.base_url = base_url.trim_end_matches('/').to_string();
    }

    match cli.command {
        Command::Ping => run_ping(config).await,
        Command::Track(args) => run_track(config, args).await,
        Command::Mask(args) => run_mask(&args),
    }
}

async fn run_ping(config: ClientConfig) -> Result<(), CliError> {
    let client = HttpSegmentationClient::new(config)?;
    client.ping().await?;
    println!("ok");
    Ok(())
}

async fn run_track(config: ClientConfig, args: TrackArgs) -> Result<(), CliError> {
    let client = HttpSegmentationClient::new(config)?;
    let (controller, mut events) = SessionController::new(Arc::new(client));
    let (handle, task) = spawn_session_worker(controller);

    handle.start_session(args.video.clone(), FrameSize::new(args.width, args.height));
    handle.add_points(args.object, args.frame, args.points.clone());
    handle.propagate(args.start_frame);

    let mut outcome = Ok(());
    let mut cancelling = false;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    outcome = Err(CliError::WorkerStopped);
                    break;
                };
                if args.snapshots || !matches!(event, SessionEvent::Snapshot(_)) {
                    print_json(&serde_json::to_value(&event)?)?;
                }
                match event {
                    SessionEvent::StreamingState { state: StreamingState::Full | StreamingState::Aborted } => break,
                    SessionEvent::Error(error) => {
                        outcome = Err(CliError::Remote {
                            operation: error.operation,
                            code: error.code,
                            message: error.message,
                        });
                        break;
                    }
                    _ => {}
                }
            }
            _ = &mut ctrl_c, if !cancelling => {
                tracing::info!("interrupt received; cancelling propagation");
                cancelling = true;
                handle.cancel_propagation();
            }
        }
    }

    handle.shutdown();
    task.await.map_err(|_| CliError::WorkerStopped)?;
    outcome
}

fn run_mask(args: &MaskArgs) -> Result<(), CliError> {
    let rle = Rle { size: [args.height, args.width], counts: args.counts.clone(), order: None };
    let bounds = masks::bounding_box(&rle)?;
    let area = masks::area(&rle)?;
    print_json(&serde_json::json!({
        "size": rle.size,
        "area": area,
        "bbox": bounds,
        "corners": bounds.corners(),
        "empty": bounds.is_empty(),
    }))
}

fn parse_point(raw: &str) -> Result<Point, String> {
    let fields: Vec<&str> = raw.split(',').map(str::trim).collect();
    let number = |field: &str| field.parse::<f64>().map_err(|_| format!("invalid coordinate `{field}` in `{raw}`"));
    match fields.as_slice() {
        [x, y] => Ok(Point::new(number(x)?, number(y)?, Point::FOREGROUND)),
        [x, y, label] => {
            let label = label.parse::<i32>().map_err(|_| format!("invalid label `{label}` in `{raw}`"))?;
            Ok(Point::new(number(x)?, number(y)?, label))
        }
        _ => Err(format!("expected x,y[,label], got `{raw}`")),
    }
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string(value)?;
    println!("{rendered}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_defaults_to_foreground() {
        let point = parse_point("12.5, 40").expect("point");
        assert_eq!(point, Point::new(12.5, 40.0, Point::FOREGROUND));
    }

    #[test]
    fn point_accepts_explicit_label() {
        let point = parse_point("3,4,0").expect("point");
        assert_eq!(point.label, Point::BACKGROUND);
    }

    #[test]
    fn point_rejects_garbage() {
        assert!(parse_point("3").is_err());
        assert!(parse_point("a,4").is_err());
        assert!(parse_point("1,2,x").is_err());
    }
}
