mod server;

use std::fs;
use std::io::{self, Read, Write};
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use flowrelay_contracts::commands::Command as DiagramCommand;
use flowrelay_contracts::decoder::{DecodeStats, StreamDecoder};
use flowrelay_contracts::events::TranscriptWriter;
use flowrelay_engine::config::non_empty_env;
use flowrelay_engine::{GeminiClient, InferenceService, RelayEngine};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const DEFAULT_PORT: u16 = 3001;
const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, Parser)]
#[command(
    name = "flowrelay",
    version,
    about = "Streams model-generated diagram edits to websocket clients"
)]
struct Cli {
    /// Tracing filter, e.g. `debug` or `flowrelay_engine=trace`. Overrides RUST_LOG.
    #[arg(long, global = true)]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the websocket relay.
    Serve(ServeArgs),
    /// Decode a saved model response into one command per line.
    Decode(DecodeArgs),
}

#[derive(Debug, Parser)]
struct ServeArgs {
    #[arg(long, default_value = "0.0.0.0")]
    host: String,
    /// Falls back to $PORT, then 3001.
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    model: Option<String>,
    /// Use the offline backend instead of Gemini.
    #[arg(long)]
    dryrun: bool,
    /// Append every client event to this JSONL file.
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct DecodeArgs {
    /// Reads stdin when omitted.
    #[arg(long)]
    input: Option<PathBuf>,
    #[arg(long, default_value_t = 64)]
    chunk_size: usize,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("flowrelay error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());
    match cli.command {
        Command::Serve(args) => run_serve(args),
        Command::Decode(args) => run_decode(args),
    }
}

fn init_logging(level: Option<&str>) {
    let filter = level
        .and_then(|raw| EnvFilter::try_new(raw).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(io::stderr),
        )
        .try_init();
}

fn run_serve(args: ServeArgs) -> Result<i32> {
    let engine = build_engine(&args)?;
    let port = args
        .port
        .or_else(|| non_empty_env("PORT").and_then(|raw| raw.parse::<u16>().ok()))
        .unwrap_or(DEFAULT_PORT);
    let addr = format!("{}:{port}", args.host);
    let listener =
        TcpListener::bind(&addr).with_context(|| format!("failed to bind {addr}"))?;
    info!(
        addr = %listener.local_addr().context("listener has no local address")?,
        backend = engine.inference_name(),
        "flowrelay listening"
    );
    let transcript = args.events.map(TranscriptWriter::open).transpose()?;
    server::serve_listener(listener, Arc::new(engine), transcript)?;
    Ok(0)
}

fn build_engine(args: &ServeArgs) -> Result<RelayEngine> {
    if args.dryrun {
        info!("using the dryrun backend");
        return Ok(RelayEngine::dryrun());
    }
    let client = GeminiClient::from_env(args.model.as_deref())?;
    if !client.is_ready() {
        warn!("GEMINI_API_KEY is not set; edit requests will be rejected until it is configured");
    }
    info!(model = %client.config().model, "using the Gemini backend");
    Ok(RelayEngine::gemini(client))
}

fn run_decode(args: DecodeArgs) -> Result<i32> {
    let raw = match args.input.as_ref() {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        None => {
            let mut raw = String::new();
            io::stdin()
                .read_to_string(&mut raw)
                .context("failed to read stdin")?;
            raw
        }
    };
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let stats = decode_transcript(&raw, args.chunk_size, &mut out)?;
    info!(
        lines = stats.lines,
        forwarded = stats.forwarded,
        skipped = stats.skipped,
        "decode finished"
    );
    Ok(0)
}

/// Feeds `raw` through the stream decoder in `chunk_size`-byte pieces and
/// writes each accepted command as compact JSON.
fn decode_transcript<W: Write>(raw: &str, chunk_size: usize, out: &mut W) -> Result<DecodeStats> {
    let mut commands: Vec<DiagramCommand> = Vec::new();
    let mut decoder = StreamDecoder::new(|command: DiagramCommand| commands.push(command))
        .with_session("decode");
    let step = chunk_size.max(1);
    let mut start = 0;
    while start < raw.len() {
        let mut end = (start + step).min(raw.len());
        while !raw.is_char_boundary(end) {
            end += 1;
        }
        decoder.ingest(&raw[start..end]);
        start = end;
    }
    let stats = decoder.finalize();
    for command in &commands {
        let line = serde_json::to_string(command).context("failed to serialize command")?;
        writeln!(out, "{line}").context("failed to write command")?;
    }
    Ok(stats)
}
