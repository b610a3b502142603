use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use framechain_core::assembler::{assemble, AssemblyRequest};
use framechain_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use framechain_core::engine::EngineClient;
use framechain_core::extend::WindowSpec;
use framechain_core::graph::WorkflowDocument;
use framechain_core::logging::{self, FileSinkPlan, LoggingInitOptions, DEFAULT_LOG_FILTER};
use framechain_core::probe::{FfprobeSource, FixedFrameSource, FrameSource};

#[derive(Parser, Debug)]
#[command(
    name = "framechain",
    about = "Extend a single-window video workflow to cover a whole clip",
    args_conflicts_with_subcommands = true,
    subcommand_negates_reqs = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    assemble: AssembleArgs,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Queue an assembled workflow on the execution engine and download its outputs.
    Submit(SubmitArgs),
}

#[derive(Args, Debug, Default)]
struct AssembleArgs {
    #[arg(required = true, help = "Single-window base workflow JSON")]
    base_graph: Option<PathBuf>,
    #[arg(required = true, help = "Driving video whose frame count sets the length")]
    media: Option<PathBuf>,
    #[arg(help = "Where to write the assembled workflow [default: from config]")]
    output: Option<PathBuf>,
    #[arg(long, help = "Use this frame count instead of probing the media")]
    frames: Option<u32>,
    #[arg(long, help = "Override the output frame rate")]
    fps: Option<f64>,
    #[arg(long, help = "Frames per generation window")]
    window: Option<u32>,
    #[arg(long, help = "Frames shared between consecutive windows")]
    overlap: Option<u32>,
    #[arg(long, value_name = "ID", help = "Id of the output node to rewire")]
    sink: Option<String>,
}

#[derive(Args, Debug)]
struct SubmitArgs {
    #[arg(help = "Assembled workflow JSON")]
    graph: PathBuf,
    #[arg(long, help = "Engine base URL [default: from config]")]
    url: Option<String>,
    #[arg(long, help = "Directory for downloaded artifacts [default: from config]")]
    download_dir: Option<PathBuf>,
}

/// Result of one assembly run, as reported to the user.
#[derive(Debug)]
struct AssembleOutcome {
    output: PathBuf,
    total_frames: u32,
    extend_count: u32,
    block_ids: Vec<u32>,
    fingerprint: String,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    log_startup_metadata(&resolved_data_dir);

    if let Err(error) = initialize_data_dir(&resolved_data_dir) {
        warn!("Could not initialize data directory: {error:#}");
    }
    let config = AppConfig::load_from_path(&config_path(&resolved_data_dir))?;

    match cli.command {
        Some(Commands::Submit(submit)) => run_submit(submit, &config).await,
        None => {
            let outcome = match cli.assemble.frames {
                Some(frame_count) => {
                    let source = FixedFrameSource {
                        frame_count,
                        frame_rate: cli.assemble.fps,
                    };
                    assemble_to_file(&cli.assemble, &config, &source)?
                }
                None => assemble_to_file(&cli.assemble, &config, &FfprobeSource)?,
            };
            print_outcome(&outcome);
            Ok(())
        }
    }
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let init_options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let plan = logging::compose_logging_init_plan(&init_options);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(parse_env_filter_with_fallback(&plan.filter, "console"));

    match plan.file_sink {
        FileSinkPlan::Ready { appender, .. } => {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(logging::redacting_make_writer(appender))
                .with_filter(parse_env_filter_with_fallback(&plan.filter, "file"));
            let subscriber = tracing_subscriber::registry()
                .with(console_layer)
                .with(file_layer);
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Fallback {
            attempted_log_dir,
            reason,
        } => {
            let subscriber = tracing_subscriber::registry().with(console_layer);
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            let attempted_log_dir = attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());
            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(data_dir: &Path) {
    info!(
        pid = std::process::id(),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

/// Loads the base graph, probes the media, assembles and writes the result.
fn assemble_to_file(
    args: &AssembleArgs,
    config: &AppConfig,
    source: &dyn FrameSource,
) -> Result<AssembleOutcome> {
    let base_path = args
        .base_graph
        .as_deref()
        .context("missing base workflow path")?;
    let media_path = args.media.as_deref().context("missing media path")?;
    let output = args
        .output
        .clone()
        .unwrap_or_else(|| config.output.graph_path.clone());

    let window = WindowSpec::new(
        args.window.unwrap_or(config.window.size),
        args.overlap.unwrap_or(config.window.overlap),
    )
    .context("invalid window settings")?;

    let mut layout = config.layout.clone();
    if let Some(sink) = &args.sink {
        layout.sink = sink.clone();
    }

    let base = WorkflowDocument::load(base_path)?;
    let probe = source
        .probe(media_path)
        .with_context(|| format!("failed to probe media {}", media_path.display()))?;
    info!(
        media = %media_path.display(),
        frames = probe.frame_count,
        fps = ?probe.frame_rate,
        "Probed media"
    );

    let request = AssemblyRequest {
        total_frames: probe.frame_count,
        window,
        frame_rate: args.fps.or(probe.frame_rate),
    };
    let assembly = assemble(base, &request, &layout)
        .with_context(|| format!("failed to assemble workflow from {}", base_path.display()))?;

    assembly.document.save(&output)?;
    let fingerprint = assembly.document.fingerprint()?;
    info!(output = %output.display(), %fingerprint, "Wrote assembled workflow");

    Ok(AssembleOutcome {
        output,
        total_frames: probe.frame_count,
        extend_count: assembly.extend_count,
        block_ids: assembly.block_ids,
        fingerprint,
    })
}

fn print_outcome(outcome: &AssembleOutcome) {
    let blocks = if outcome.block_ids.is_empty() {
        "none".to_string()
    } else {
        outcome
            .block_ids
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    };
    println!(
        "Assembled {} frames with {} extend block(s) [{blocks}]",
        outcome.total_frames, outcome.extend_count
    );
    println!("Saved: {}", outcome.output.display());
    println!("SHA-256: {}", outcome.fingerprint);
}

async fn run_submit(args: SubmitArgs, config: &AppConfig) -> Result<()> {
    let document = WorkflowDocument::load(&args.graph)?;
    document
        .validate()
        .with_context(|| format!("refusing to submit invalid workflow {}", args.graph.display()))?;

    let url = args.url.as_deref().unwrap_or(&config.engine.url);
    let download_dir = args
        .download_dir
        .unwrap_or_else(|| config.output.download_dir.clone());
    let client = EngineClient::new(url)?;
    info!(engine = %client.base_url(), client_id = client.client_id(), "Submitting workflow");

    let job_id = client.submit(&document).await?;
    println!("Queued job {job_id}");

    let history = client
        .wait_for_completion(
            &job_id,
            config.engine.poll_interval(),
            config.engine.timeout(),
        )
        .await?;

    let outputs = history.artifacts();
    if outputs.is_empty() {
        bail!("job {job_id} finished without any output artifacts");
    }

    tokio::fs::create_dir_all(&download_dir)
        .await
        .with_context(|| format!("failed to create download directory {}", download_dir.display()))?;

    for (node_id, artifacts) in outputs {
        for artifact in artifacts {
            let bytes = client.fetch_artifact(artifact).await?;
            let file_name = Path::new(&artifact.filename)
                .file_name()
                .with_context(|| format!("artifact has no file name: {}", artifact.filename))?;
            let target = download_dir.join(file_name);
            tokio::fs::write(&target, &bytes)
                .await
                .with_context(|| format!("failed to write {}", target.display()))?;
            info!(node = node_id, path = %target.display(), bytes = bytes.len(), "Downloaded artifact");
            println!("Downloaded: {}", target.display());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread;
    use std::time::Duration;

    fn node(class_type: &str, inputs: serde_json::Value) -> serde_json::Value {
        json!({"inputs": inputs, "class_type": class_type, "_meta": {"title": class_type}})
    }

    fn write_base_graph(dir: &Path) -> PathBuf {
        let graph = json!({
            "130": node("VHS_LoadVideo", json!({"video": "pose.mp4", "frame_load_cap": 0})),
            "99": node("WanVideoEmptyEmbeds", json!({"num_frames": 81})),
            "195": node("WanVideoAddOneToAllReferenceEmbeds", json!({"num_frames": 81})),
            "169": node("INTConstant", json!({"value": 5})),
            "231": node("WanVideoSchedulerSettings", json!({})),
            "238": node("FloatConstant", json!({"value": 1.0})),
            "38": node("WanVideoVAELoader", json!({})),
            "80": node("WanVideoModelLoader", json!({})),
            "16": node("WanVideoTextEncode", json!({})),
            "141": node("PoseDetection", json!({"images": ["130", 0]})),
            "105": node("WanVideoAddOneToAllReferenceEmbeds", json!({})),
            "28": node("WanVideoDecode", json!({"vae": ["38", 0]})),
            "139": node("VHS_VideoCombine", json!({"frame_rate": 16, "images": ["28", 0]})),
        });
        let path = dir.join("base.json");
        std::fs::write(&path, serde_json::to_string_pretty(&graph).unwrap()).unwrap();
        path
    }

    fn args_for(dir: &Path) -> AssembleArgs {
        AssembleArgs {
            base_graph: Some(write_base_graph(dir)),
            media: Some(dir.join("pose.mp4")),
            output: Some(dir.join("out").join("dynamic_workflow.json")),
            ..Default::default()
        }
    }

    #[test]
    fn parses_positional_assembly_args() {
        let cli = Cli::try_parse_from([
            "framechain",
            "base.json",
            "pose.mp4",
            "--frames",
            "320",
            "--overlap",
            "8",
        ])
        .unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.assemble.base_graph, Some(PathBuf::from("base.json")));
        assert_eq!(cli.assemble.media, Some(PathBuf::from("pose.mp4")));
        assert_eq!(cli.assemble.output, None);
        assert_eq!(cli.assemble.frames, Some(320));
        assert_eq!(cli.assemble.overlap, Some(8));
    }

    #[test]
    fn assembly_requires_media() {
        assert!(Cli::try_parse_from(["framechain", "base.json"]).is_err());
    }

    #[test]
    fn submit_subcommand_skips_positionals() {
        let cli = Cli::try_parse_from([
            "framechain",
            "-v",
            "submit",
            "dynamic_workflow.json",
            "--url",
            "http://gpu-box:8188",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 1);
        match cli.command {
            Some(Commands::Submit(submit)) => {
                assert_eq!(submit.graph, PathBuf::from("dynamic_workflow.json"));
                assert_eq!(submit.url.as_deref(), Some("http://gpu-box:8188"));
            }
            None => panic!("expected submit subcommand"),
        }
    }

    #[test]
    fn assemble_to_file_writes_extended_graph() {
        let temp = tempfile::tempdir().unwrap();
        let args = args_for(temp.path());
        let source = FixedFrameSource {
            frame_count: 320,
            frame_rate: Some(24.0),
        };

        let outcome = assemble_to_file(&args, &AppConfig::default(), &source).unwrap();
        assert_eq!(outcome.extend_count, 4);
        assert_eq!(outcome.block_ids, vec![263, 297, 311, 345]);
        assert_eq!(outcome.fingerprint.len(), 64);

        let written = WorkflowDocument::load(&outcome.output).unwrap();
        assert_eq!(written.len(), 13 + 8 * 4 + 1);
        assert_eq!(written.fingerprint().unwrap(), outcome.fingerprint);
        let sink = written.require("139").unwrap();
        assert_eq!(sink.input("frame_rate").and_then(|v| v.as_u64()), Some(24));
    }

    #[test]
    fn window_flags_override_config() {
        let temp = tempfile::tempdir().unwrap();
        let args = AssembleArgs {
            window: Some(41),
            overlap: Some(1),
            ..args_for(temp.path())
        };
        let source = FixedFrameSource {
            frame_count: 120,
            frame_rate: None,
        };

        let outcome = assemble_to_file(&args, &AppConfig::default(), &source).unwrap();
        // 41 + 2 * 40 >= 120
        assert_eq!(outcome.extend_count, 2);
    }

    #[test]
    fn invalid_window_is_rejected_before_loading() {
        let temp = tempfile::tempdir().unwrap();
        let args = AssembleArgs {
            window: Some(5),
            overlap: Some(5),
            ..args_for(temp.path())
        };
        let source = FixedFrameSource {
            frame_count: 10,
            frame_rate: None,
        };

        let err = assemble_to_file(&args, &AppConfig::default(), &source).unwrap_err();
        assert!(format!("{err:#}").contains("invalid window settings"));
    }

    #[test]
    fn missing_sink_is_created_under_requested_id() {
        let temp = tempfile::tempdir().unwrap();
        let args = AssembleArgs {
            sink: Some("500".to_string()),
            ..args_for(temp.path())
        };
        let source = FixedFrameSource {
            frame_count: 60,
            frame_rate: None,
        };

        let outcome = assemble_to_file(&args, &AppConfig::default(), &source).unwrap();
        let written = WorkflowDocument::load(&outcome.output).unwrap();
        let sink = written.require("500").unwrap();
        assert_eq!(sink.operation, "VHS_VideoCombine");
        assert_eq!(sink.input("frame_rate").and_then(|v| v.as_u64()), Some(16));
    }

    /// Minimal engine stand-in: answers each connection with the body of the
    /// first route whose prefix matches the request path.
    fn spawn_engine(routes: Vec<(&'static str, String)>, connections: usize) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind test server");
        let addr = listener.local_addr().expect("local addr");

        thread::spawn(move || {
            for _ in 0..connections {
                let Ok((mut stream, _)) = listener.accept() else {
                    return;
                };
                let path = read_request_path(&mut stream);
                let (status, body) = routes
                    .iter()
                    .find(|(prefix, _)| path.starts_with(prefix))
                    .map(|(_, body)| ("200 OK", body.clone()))
                    .unwrap_or(("404 Not Found", String::new()));
                let response = format!(
                    "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes());
                let _ = stream.flush();
            }
        });

        format!("http://{addr}")
    }

    fn read_request_path(stream: &mut TcpStream) -> String {
        let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
        let mut data = Vec::new();
        let mut buffer = [0u8; 4096];
        loop {
            if let Some(header_end) = data.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&data[..header_end]).to_string();
                let body_len = head
                    .lines()
                    .filter_map(|line| line.split_once(':'))
                    .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if data.len() >= header_end + 4 + body_len {
                    return head
                        .split_whitespace()
                        .nth(1)
                        .unwrap_or_default()
                        .to_string();
                }
            }
            match stream.read(&mut buffer) {
                Ok(0) | Err(_) => return String::new(),
                Ok(n) => data.extend_from_slice(&buffer[..n]),
            }
        }
    }

    fn submit_args(dir: &Path, url: String) -> SubmitArgs {
        let graph = json!({
            "900": node("GetImageRangeFromBatch", json!({"start_index": 0, "num_frames": 60})),
            "139": node("VHS_VideoCombine", json!({"frame_rate": 16, "images": ["900", 0]})),
        });
        let path = dir.join("dynamic_workflow.json");
        std::fs::write(&path, serde_json::to_string_pretty(&graph).unwrap()).unwrap();
        SubmitArgs {
            graph: path,
            url: Some(url),
            download_dir: Some(dir.join("downloads")),
        }
    }

    #[tokio::test]
    async fn submit_fails_when_engine_reports_error() {
        let history = json!({
            "abc": {
                "outputs": {},
                "status": {
                    "status_str": "error",
                    "completed": false,
                    "messages": [["execution_error", {
                        "prompt_id": "abc",
                        "node_id": "139",
                        "exception_message": "Video not found."
                    }]]
                }
            }
        });
        let url = spawn_engine(
            vec![
                ("/prompt", r#"{"prompt_id": "abc"}"#.to_string()),
                ("/history/abc", history.to_string()),
            ],
            2,
        );
        let temp = tempfile::tempdir().unwrap();

        let err = run_submit(submit_args(temp.path(), url), &AppConfig::default())
            .await
            .unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("failed on node 139"), "{message}");
        assert!(message.contains("Video not found."), "{message}");
        assert!(!temp.path().join("downloads").exists());
    }

    #[tokio::test]
    async fn submit_fails_when_job_has_no_artifacts() {
        let history = json!({
            "abc": {
                "outputs": {"139": {"gifs": []}},
                "status": {"status_str": "success", "completed": true, "messages": []}
            }
        });
        let url = spawn_engine(
            vec![
                ("/prompt", r#"{"prompt_id": "abc"}"#.to_string()),
                ("/history/abc", history.to_string()),
            ],
            2,
        );
        let temp = tempfile::tempdir().unwrap();

        let err = run_submit(submit_args(temp.path(), url), &AppConfig::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("without any output artifacts"));
    }

    #[tokio::test]
    async fn submit_downloads_artifacts() {
        let history = json!({
            "abc": {
                "outputs": {"139": {"gifs": [{
                    "filename": "WanVideo_OneToAllAnimation_00001.mp4",
                    "subfolder": "",
                    "type": "output"
                }]}},
                "status": {"status_str": "success", "completed": true, "messages": []}
            }
        });
        let url = spawn_engine(
            vec![
                ("/prompt", r#"{"prompt_id": "abc"}"#.to_string()),
                ("/history/abc", history.to_string()),
                ("/view", "mp4-bytes".to_string()),
            ],
            3,
        );
        let temp = tempfile::tempdir().unwrap();

        run_submit(submit_args(temp.path(), url), &AppConfig::default())
            .await
            .unwrap();
        let saved = temp
            .path()
            .join("downloads")
            .join("WanVideo_OneToAllAnimation_00001.mp4");
        assert_eq!(std::fs::read_to_string(saved).unwrap(), "mp4-bytes");
    }
}
