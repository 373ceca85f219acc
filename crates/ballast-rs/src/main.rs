//! Run a tool-calling conversation against an OpenAI-compatible endpoint,
//! or embed lines from stdin.
//!
//! Reads `OPENAI_API_KEY` and `OPENAI_BASE_URL` from the environment.
//!
//! # Examples
//!
//! ```sh
//! # Streamed answer
//! ballast --user "Summarize the release notes" --model gpt-4o-mini
//!
//! # Shell-command tools, recorded to JSONL
//! ballast --user "How many words are in README.md?" \
//!   --tools tools.json --record records.jsonl --max-turns 6
//!
//! # Blocking mode with raw payload traces
//! ballast --user "Plan the migration" --blocking --trace-dir traces/
//!
//! # Embed one vector per input line
//! cat sentences.txt | ballast --embed --embed-model text-embedding-3-small
//! ```

use ballast_rs::agent::{DirTraceSink, Orchestrator, OrchestratorConfig, StreamEvent};
use ballast_rs::api::{
    BreakerConfig, BreakerRegistry, GuardedModel, PoolConfig, WorkerPool, embed_all,
};
use ballast_rs::recording::{ConversationRecorder, JsonlStore, RecorderConfig};
use ballast_rs::tools::{CommandTool, ToolSet};
use ballast_rs::{ClientConfig, Message, OpenAiClient};
use clap::Parser;
use futures::StreamExt;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Run a tool-calling conversation against an OpenAI-compatible endpoint.
///
/// Reads the API key from the OPENAI_API_KEY environment variable.
#[derive(Parser)]
#[command(name = "ballast")]
struct Cli {
    // ── Message content ────────────────────────────────────────
    /// System prompt to set the assistant's behavior
    #[arg(long)]
    system: Option<String>,

    /// User message to send
    #[arg(long)]
    user: Option<String>,

    /// Read user content (or embedding inputs) from stdin
    #[arg(long)]
    stdin: bool,

    // ── Endpoint ───────────────────────────────────────────────
    /// Model to use
    #[arg(long, default_value = ballast_rs::DEFAULT_MODEL)]
    model: String,

    /// Base URL of the endpoint (overrides OPENAI_BASE_URL)
    #[arg(long)]
    base_url: Option<String>,

    /// Consecutive failures before the circuit opens
    #[arg(long, default_value_t = 5)]
    breaker_threshold: u32,

    // ── Sampling ───────────────────────────────────────────────
    /// Sampling temperature (defaults: 0.7 streaming, 0.2 blocking)
    #[arg(long)]
    temperature: Option<f32>,

    /// Maximum tokens per turn
    #[arg(long, default_value_t = 0)]
    max_tokens: u32,

    // ── Loop control ───────────────────────────────────────────
    /// Maximum model turns
    #[arg(long, default_value_t = 10)]
    max_turns: u32,

    /// One blocking request per turn instead of streaming
    #[arg(long)]
    blocking: bool,

    // ── Tools ──────────────────────────────────────────────────
    /// Path to a JSON file of shell-command tools
    #[arg(long)]
    tools: Option<PathBuf>,

    /// Working directory for tool commands
    #[arg(long)]
    workdir: Option<PathBuf>,

    /// Validate tool arguments against their JSON Schema
    #[arg(long)]
    validate_args: bool,

    // ── Recording / tracing ────────────────────────────────────
    /// Append conversation records to this JSONL file
    #[arg(long)]
    record: Option<PathBuf>,

    /// Project id stored on every record
    #[arg(long, default_value = "default")]
    project: String,

    /// Write raw request/response payloads under this directory
    #[arg(long)]
    trace_dir: Option<PathBuf>,

    // ── Embeddings ─────────────────────────────────────────────
    /// Embed stdin lines instead of chatting; prints one JSON array per line
    #[arg(long)]
    embed: bool,

    /// Embedding model
    #[arg(long, default_value = "text-embedding-3-small")]
    embed_model: String,

    /// Inputs per embedding request
    #[arg(long, default_value_t = 16)]
    batch_size: usize,

    /// Concurrent embedding requests
    #[arg(long, default_value_t = 8)]
    concurrency: usize,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

fn read_stdin() -> Result<String, String> {
    let mut buf = String::new();
    io::stdin()
        .read_to_string(&mut buf)
        .map_err(|e| format!("Failed to read stdin: {e}"))?;
    Ok(buf)
}

fn build_client(cli: &Cli) -> Result<OpenAiClient, String> {
    let mut config = ClientConfig::from_env();
    if let Some(url) = &cli.base_url {
        config = config.with_base_url(url.clone());
    }
    OpenAiClient::new(config)
}

fn load_tools(cli: &Cli) -> Result<ToolSet, String> {
    let mut set = ToolSet::new().with_arg_validation(cli.validate_args);
    if let Some(path) = &cli.tools {
        let tools = CommandTool::load_file(path).map_err(|e| e.to_string())?;
        info!("Loaded {} tool(s) from {}", tools.len(), path.display());
        for tool in tools {
            let tool = match &cli.workdir {
                Some(dir) => tool.workdir(dir),
                None => tool,
            };
            set.register(tool);
        }
    }
    Ok(set)
}

async fn run_embed(cli: &Cli, cancel: &CancellationToken) -> Result<(), String> {
    let inputs: Vec<String> = read_stdin()?
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect();
    let client = Arc::new(build_client(cli)?);
    let pool = WorkerPool::new(PoolConfig::default().with_max_concurrent(cli.concurrency));
    let vectors = embed_all(
        client,
        &cli.embed_model,
        inputs,
        cli.batch_size,
        &pool,
        cancel,
    )
    .await
    .map_err(|e| e.to_string())?;

    let mut out = io::stdout().lock();
    for vector in vectors {
        let line = serde_json::to_string(&vector).map_err(|e| e.to_string())?;
        writeln!(out, "{line}").map_err(|e| e.to_string())?;
    }
    Ok(())
}

async fn run_chat(cli: &Cli, cancel: &CancellationToken) -> Result<(), String> {
    let user_content = match (&cli.user, cli.stdin) {
        (Some(user), false) => user.clone(),
        (Some(user), true) => format!("{user}\n\n{}", read_stdin()?),
        (None, true) => read_stdin()?,
        (None, false) => return Err("--user or --stdin is required".to_string()),
    };

    let mut messages = Vec::new();
    if let Some(system) = &cli.system {
        messages.push(Message::system(system));
    }
    messages.push(Message::user(user_content));

    let registry = BreakerRegistry::new(BreakerConfig::default().with_threshold(cli.breaker_threshold));
    let model = Arc::new(GuardedModel::from_registry(build_client(cli)?, &registry));
    let tools = Arc::new(load_tools(cli)?);

    let mut config = OrchestratorConfig::new(&cli.model)
        .with_max_turns(cli.max_turns)
        .with_max_tokens(cli.max_tokens)
        .with_project_id(&cli.project)
        .with_context("source", "cli");
    if let Some(t) = cli.temperature {
        config = config.with_temperature(t).with_tool_temperature(t);
    }

    let recorder = match &cli.record {
        Some(path) => {
            let store = JsonlStore::open(path).await.map_err(|e| e.to_string())?;
            Some(Arc::new(ConversationRecorder::new(
                Arc::new(store),
                RecorderConfig::default(),
            )))
        }
        None => None,
    };

    let mut orchestrator = Orchestrator::new(model, tools, config);
    if let Some(recorder) = &recorder {
        orchestrator = orchestrator.with_recorder(recorder.clone());
    }
    if let Some(dir) = &cli.trace_dir {
        orchestrator = orchestrator.with_trace_sink(Arc::new(DirTraceSink::new(dir)));
    }
    let orchestrator = Arc::new(orchestrator);

    let result = if cli.blocking {
        orchestrator.run(messages, cancel).await.map(|text| {
            println!("{text}");
        })
    } else {
        let (mut events, handle) = orchestrator.spawn_stream(messages, cancel.clone());
        let mut stdout = io::stdout();
        while let Some(event) = events.next().await {
            match event {
                StreamEvent::Text { content } => {
                    print!("{content}");
                    let _ = stdout.flush();
                }
                StreamEvent::ToolCall {
                    name, arguments, ..
                } => eprintln!("\n  [tool_call] {name}({arguments})"),
                StreamEvent::ToolResult { name, is_error, .. } => {
                    let status = if is_error { "error" } else { "ok" };
                    eprintln!("  [tool_result] {name}: {status}");
                }
                StreamEvent::Done { .. } => println!(),
                StreamEvent::Error { .. } => {}
            }
        }
        match handle.await {
            Ok(result) => result.map(|_| ()),
            Err(e) => return Err(format!("orchestrator task failed: {e}")),
        }
    };

    if let Some(recorder) = &recorder {
        recorder.close().await;
        let stats = recorder.stats();
        debug!(
            "Recorder: {} persisted, {} failed, {} dropped",
            stats.persisted, stats.failed, stats.dropped
        );
    }
    for (endpoint, state) in registry.states() {
        debug!("Circuit {endpoint}: {state}");
    }

    result.map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; cancelling");
            on_signal.cancel();
        }
    });

    let result = if cli.embed {
        run_embed(&cli, &cancel).await
    } else {
        run_chat(&cli, &cancel).await
    };
    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
