mod config;

use std::{
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use booth_core::{
    effects::{self, Effect},
    BoothEvent, CommandFrameSource, FileQueueSource, FrameSource, GifOptions, HandoffError,
    HandoffStore, HttpBackend, PhotoBooth, ShotOutcome,
};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use shared::{
    domain::{DelaySeconds, Frame, Layout, RateId, TemplateId},
    protocol::{CompositeResult, CreateOrderRequest, HandoffRecord},
};
use storage::Storage;
use tokio::{
    io::{AsyncBufReadExt, BufReader, Lines, Stdin},
    sync::broadcast,
};
use tokio_stream::{
    wrappers::{errors::BroadcastStreamRecvError, BroadcastStream},
    StreamExt,
};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Settings;

const MAX_CONSECUTIVE_DEVICE_FAILURES: u32 = 3;

#[derive(Parser, Debug)]
#[command(name = "booth", about = "Guided multi-shot photobooth capture")]
struct Cli {
    /// Path to the flat TOML settings file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    backend_url: Option<String>,
    #[arg(long, global = true)]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List compositing templates offered by the backend.
    Templates,
    /// Show the available layouts and countdown delays.
    Layouts,
    /// Remember the template used for the next capture.
    Select { template_id: i64 },
    /// Turn a voucher code into an order.
    Redeem {
        voucher_code: String,
        #[arg(long, default_value_t = 1)]
        rate_id: i64,
        #[arg(long, default_value_t = 1)]
        quantity: u32,
        #[arg(long, default_value = "")]
        notes: String,
    },
    /// Run a guided capture session and upload the frames.
    Capture(CaptureArgs),
    /// Write the composite of the last session.
    Result {
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Apply an effect to the last session's frames and save them locally.
    Effect {
        effect: String,
        #[arg(long, default_value = ".")]
        output_dir: PathBuf,
    },
    /// Assemble the last session's frames (or the given files) into a GIF.
    Gif {
        #[arg(long, default_value = "booth.gif")]
        output: PathBuf,
        #[arg(long, num_args = 1..)]
        files: Vec<PathBuf>,
        #[arg(long, default_value_t = 400)]
        width: u32,
        #[arg(long, default_value_t = 400)]
        height: u32,
        #[arg(long, default_value_t = 500)]
        frame_delay_ms: u64,
        #[arg(long, default_value_t = 10)]
        speed: i32,
    },
    /// Forget the last session's frames and result.
    Reset,
}

#[derive(Args, Debug)]
struct CaptureArgs {
    /// Layout preset name ("4 Pose") or a shot count.
    #[arg(long)]
    layout: Option<String>,
    #[arg(long)]
    delay: Option<u32>,
    #[arg(long)]
    template: Option<i64>,
    /// Use these image files instead of the capture command.
    #[arg(long, num_args = 1..)]
    files: Vec<PathBuf>,
    /// Ask after every shot whether to keep it.
    #[arg(long)]
    review: bool,
    /// Re-composite with this effect once the first result is in.
    #[arg(long)]
    effect: Option<String>,
    #[arg(long)]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();
    let mut settings = config::load_settings(cli.config.as_deref());
    if let Some(backend_url) = cli.backend_url {
        settings.backend_url = backend_url;
    }
    if let Some(database_url) = cli.database_url {
        settings.database_url = database_url;
    }

    let database_url = config::prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url)
        .await
        .with_context(|| format!("failed to open booth database '{database_url}'"))?;
    let backend = HttpBackend::new(&settings.backend_url)
        .with_context(|| format!("invalid backend url '{}'", settings.backend_url))?
        .with_access_token(settings.access_token.clone());
    debug!(backend = %backend.base_url(), database = %database_url, "booth configured");

    match cli.command {
        Command::Templates => list_templates(&backend).await?,
        Command::Layouts => list_layouts(),
        Command::Select { template_id } => {
            let mut handoff = HandoffStore::new(Arc::new(storage));
            handoff.select_template(TemplateId(template_id)).await;
            println!("selected template {template_id}");
        }
        Command::Redeem {
            voucher_code,
            rate_id,
            quantity,
            notes,
        } => {
            let receipt = backend
                .create_order(&CreateOrderRequest {
                    rate_id: RateId(rate_id),
                    quantity,
                    voucher_code,
                    notes,
                })
                .await
                .context("voucher redemption failed")?;
            match receipt.id() {
                Some(order_id) => println!("order {order_id} created"),
                None => println!("order created: {}", receipt.0),
            }
        }
        Command::Capture(args) => run_capture(&settings, storage, backend, args).await?,
        Command::Result { output } => {
            let Some(record) = load_last_session(storage).await else {
                return Ok(());
            };
            match &record.result {
                Some(result) => write_result(result, output.as_deref()).await?,
                None => println!(
                    "last session has {} frame(s) but no composite yet",
                    record.frames.len()
                ),
            }
        }
        Command::Effect { effect, output_dir } => {
            let effect: Effect = effect.parse()?;
            let Some(record) = load_last_session(storage).await else {
                return Ok(());
            };
            save_with_effect(&record.frames, effect, &output_dir).await?;
        }
        Command::Gif {
            output,
            files,
            width,
            height,
            frame_delay_ms,
            speed,
        } => {
            let frames = if files.is_empty() {
                let Some(record) = load_last_session(storage).await else {
                    return Ok(());
                };
                record.frames
            } else {
                read_frames(&files).await?
            };
            let options = GifOptions {
                width,
                height,
                frame_delay: Duration::from_millis(frame_delay_ms),
                speed,
            };
            let bytes = booth_core::assemble_gif(&frames, &options)?;
            tokio::fs::write(&output, &bytes)
                .await
                .with_context(|| format!("failed to write '{}'", output.display()))?;
            println!("wrote {} ({} frames)", output.display(), frames.len());
        }
        Command::Reset => {
            let mut handoff = HandoffStore::new(Arc::new(storage));
            handoff.clear_session().await;
            println!("session data cleared");
        }
    }

    Ok(())
}

async fn list_templates(backend: &HttpBackend) -> Result<()> {
    let templates = backend
        .list_templates()
        .await
        .context("failed to fetch templates")?;
    if templates.is_empty() {
        println!("backend offers no templates");
    }
    for template in templates {
        match template.detection_method {
            Some(method) => println!("{}\t{}\t({method})", template.id, template.name),
            None => println!("{}\t{}", template.id, template.name),
        }
    }
    Ok(())
}

fn list_layouts() {
    for layout in Layout::presets() {
        println!("{layout}");
    }
    let delays: Vec<String> = DelaySeconds::PRESETS
        .iter()
        .map(|seconds| format!("{seconds}s"))
        .collect();
    println!("delays: {}", delays.join(", "));
}

fn parse_layout(name: &str) -> Result<Layout> {
    if let Some(layout) = Layout::preset(name) {
        return Ok(layout);
    }
    if let Ok(shots) = name.trim().parse::<u32>() {
        return Ok(Layout::new(format!("{shots} Pose"), shots)?);
    }
    let presets: Vec<String> = Layout::presets()
        .iter()
        .map(|layout| layout.name().to_string())
        .collect();
    bail!("unknown layout '{name}' (choose from {})", presets.join(", "))
}

async fn run_capture(
    settings: &Settings,
    storage: Storage,
    backend: HttpBackend,
    args: CaptureArgs,
) -> Result<()> {
    let layout = parse_layout(args.layout.as_deref().unwrap_or(&settings.default_layout))?;
    let delay = DelaySeconds::new(args.delay.unwrap_or(settings.default_delay))?;
    let effect = args.effect.as_deref().map(str::parse::<Effect>).transpose()?;

    let frame_source: Arc<dyn FrameSource> = if !args.files.is_empty() {
        Arc::new(FileQueueSource::new(args.files))
    } else if let Some(program) = &settings.capture_command {
        Arc::new(CommandFrameSource::new(
            program.clone(),
            settings.capture_args.clone(),
        ))
    } else {
        bail!("no frame source: pass --files or configure capture_command");
    };
    info!(source = %frame_source.describe(), "frame source ready");

    let mut booth =
        PhotoBooth::new_with_dependencies(frame_source, Arc::new(backend), Arc::new(storage))
            .with_upload_timeout(Duration::from_secs(settings.upload_timeout_secs));
    if let Some(template_id) = args.template {
        booth.select_template(TemplateId(template_id)).await;
    }

    let renderer = tokio::spawn(render_events(booth.subscribe_events()));
    let interrupt = booth.interrupt_handle();
    let ctrl_c = tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            interrupt.interrupt();
        }
    });

    let outcome = drive_session(&mut booth, layout, delay, args.review, effect).await;
    ctrl_c.abort();
    drop(booth);
    let _ = renderer.await;

    match outcome? {
        Some(result) => write_result(&result, args.output.as_deref()).await,
        None => {
            println!("session cancelled");
            Ok(())
        }
    }
}

/// Runs one guided session; `None` means the user abandoned it.
async fn drive_session(
    booth: &mut PhotoBooth,
    layout: Layout,
    delay: DelaySeconds,
    review: bool,
    effect: Option<Effect>,
) -> Result<Option<CompositeResult>> {
    let session_id = booth
        .confirm(layout.clone(), delay)
        .await
        .context("cannot start session")?;
    println!(
        "session {session_id}: {layout}, {}s countdown per shot",
        delay.get()
    );

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut device_failures = 0;
    let mut outcome = booth.request_shot().await;
    let result = loop {
        outcome = match outcome {
            ShotOutcome::Captured {
                shot_index,
                total_shots,
            } => {
                device_failures = 0;
                if review {
                    let question = format!("keep shot {shot_index}/{total_shots}? [Y/n] ");
                    let Some(keep) = ask(&mut stdin, &question, true).await? else {
                        booth.reset().await;
                        return Ok(None);
                    };
                    if !keep {
                        booth.retake();
                    }
                }
                booth.request_shot().await
            }
            ShotOutcome::DeviceUnavailable => {
                device_failures += 1;
                if device_failures >= MAX_CONSECUTIVE_DEVICE_FAILURES {
                    booth.reset().await;
                    bail!("capture device returned no image {device_failures} times in a row");
                }
                booth.request_shot().await
            }
            ShotOutcome::Rejected(reason) => {
                bail!("shot request rejected: {reason:?}");
            }
            ShotOutcome::Interrupted => {
                booth.reset().await;
                return Ok(None);
            }
            ShotOutcome::UploadFailed(message) => {
                match ask(&mut stdin, "retry upload? [y/N] ", false).await? {
                    Some(true) => booth.retry_upload().await?,
                    Some(false) => {
                        booth.reset().await;
                        bail!("upload failed: {message}");
                    }
                    None => {
                        booth.reset().await;
                        return Ok(None);
                    }
                }
            }
            ShotOutcome::Completed(result) => break result,
        };
    };

    let result = match effect {
        Some(effect) if effect != Effect::Original => {
            match booth.reprocess_with_effect(effect).await {
                Ok(result) => result,
                Err(err) => {
                    warn!(%effect, error = %err, "keeping the unfiltered composite");
                    result
                }
            }
        }
        _ => result,
    };
    Ok(Some(result))
}

async fn render_events(events: broadcast::Receiver<BoothEvent>) {
    let mut stream = BroadcastStream::new(events);
    while let Some(event) = stream.next().await {
        match event {
            Ok(BoothEvent::CountdownTick { remaining }) => println!("  {remaining}..."),
            Ok(BoothEvent::FrameCaptured {
                shot_index,
                total_shots,
            }) => println!("captured shot {shot_index}/{total_shots}"),
            Ok(BoothEvent::CaptureFailed { shot }) => {
                println!("shot {shot}: no image from the device, try again")
            }
            Ok(BoothEvent::UploadProgress { percent }) => {
                print!("\ruploading {percent:>3.0}%");
                let _ = std::io::stdout().flush();
            }
            Ok(BoothEvent::UploadCompleted(result)) => {
                println!("\ncomposite ready{}", message_suffix(&result));
            }
            Ok(BoothEvent::UploadFailed { message }) => println!("\nupload failed: {message}"),
            Ok(BoothEvent::SessionReset) => println!("session reset"),
            Ok(BoothEvent::PhaseChanged(snapshot)) => debug!(
                phase = %snapshot.phase,
                shot_index = snapshot.shot_index,
                total_shots = snapshot.total_shots,
                "phase changed"
            ),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "event output fell behind")
            }
        }
    }
}

fn message_suffix(result: &CompositeResult) -> String {
    result
        .message()
        .map(|message| format!(": {message}"))
        .unwrap_or_default()
}

/// Reads a yes/no answer; `None` when Ctrl-C arrives while waiting.
async fn ask(
    lines: &mut Lines<BufReader<Stdin>>,
    question: &str,
    default: bool,
) -> Result<Option<bool>> {
    print!("{question}");
    std::io::stdout().flush()?;
    let line = tokio::select! {
        line = lines.next_line() => line?,
        _ = tokio::signal::ctrl_c() => {
            println!();
            return Ok(None);
        }
    };
    let Some(line) = line else {
        return Ok(Some(default));
    };
    Ok(Some(parse_answer(&line, default)))
}

fn parse_answer(line: &str, default: bool) -> bool {
    match line.trim().to_ascii_lowercase().as_str() {
        "" => default,
        "y" | "yes" => true,
        _ => false,
    }
}

async fn load_last_session(storage: Storage) -> Option<HandoffRecord> {
    let handoff = HandoffStore::new(Arc::new(storage));
    match handoff.load_for_results().await {
        Ok(record) => Some(record),
        Err(HandoffError::NoHandoffData) => {
            println!("no session data found; start a new capture with `booth capture`");
            None
        }
    }
}

async fn write_result(result: &CompositeResult, output: Option<&Path>) -> Result<()> {
    let Some(image) = result.decode_image()? else {
        println!(
            "backend returned no image (status: {}){}",
            result.status().unwrap_or("unknown"),
            message_suffix(result)
        );
        return Ok(());
    };

    let path = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(format!("cekrek-{}.png", Utc::now().timestamp_millis())));
    tokio::fs::write(&path, &image)
        .await
        .with_context(|| format!("failed to write '{}'", path.display()))?;
    println!("saved composite to {}", path.display());
    Ok(())
}

async fn save_with_effect(frames: &[Frame], effect: Effect, output_dir: &Path) -> Result<()> {
    if frames.is_empty() {
        println!("last session has no frames");
        return Ok(());
    }
    let processed = effects::apply_to_all(frames, effect)?;
    tokio::fs::create_dir_all(output_dir)
        .await
        .with_context(|| format!("failed to create '{}'", output_dir.display()))?;

    let stamp = Utc::now().timestamp_millis();
    for (index, frame) in processed.iter().enumerate() {
        let path = output_dir.join(format!("cekrek-{effect}-{stamp}-photo{}.jpg", index + 1));
        tokio::fs::write(&path, frame.bytes())
            .await
            .with_context(|| format!("failed to write '{}'", path.display()))?;
        println!("saved {}", path.display());
    }
    Ok(())
}

async fn read_frames(paths: &[PathBuf]) -> Result<Vec<Frame>> {
    let source = FileQueueSource::new(paths.iter().cloned());
    let mut frames = Vec::with_capacity(paths.len());
    for path in paths {
        let frame = source
            .acquire_frame()
            .await
            .with_context(|| format!("could not read image '{}'", path.display()))?;
        frames.push(frame);
    }
    Ok(frames)
}
