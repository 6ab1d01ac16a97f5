//! CLI entry point for genloop.
//!
//! The `genloop` binary hosts the engine in a terminal: an interactive chat,
//! one-shot questions, and inspection of the configuration and credential
//! pool.

mod tools;

use std::io::{self, BufRead, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use genloop_engine::{
    ConfigChange, ConfigManager, Engine, EngineConfig, GenerateRequest, Generation,
    InMemoryHistory, Outcome, Turn,
};

use crate::tools::NoteBook;

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// genloop: a credential-rotating, tool-calling generation engine.
#[derive(Parser)]
#[command(
    name = "genloop",
    version,
    about = "genloop: credential-rotating, tool-calling generation engine"
)]
struct Cli {
    /// Configuration file (TOML, or JSON by extension).
    #[arg(long, short, global = true, default_value = "genloop.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat interactively.
    Chat {
        /// Model alias; defaults to the configured default model.
        #[arg(long)]
        model: Option<String>,
        #[arg(long, default_value = "cli-user")]
        user: String,
        #[arg(long, default_value = "terminal")]
        room: String,
    },

    /// Ask a single question and print the reply.
    Ask {
        message: String,
        #[arg(long)]
        model: Option<String>,
    },

    /// Validate the configuration and print a summary.
    CheckConfig,

    /// Show the credential pool.
    Pool,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    match cli.command {
        Commands::Chat { model, user, room } => cmd_chat(&cli.config, model, user, room).await,
        Commands::Ask { message, model } => cmd_ask(&cli.config, message, model).await,
        Commands::CheckConfig => cmd_check_config(&cli.config),
        Commands::Pool => cmd_pool(&cli.config),
    }
}

// ---------------------------------------------------------------------------
// Subcommand: chat
// ---------------------------------------------------------------------------

async fn cmd_chat(
    config_path: &Path,
    model: Option<String>,
    user: String,
    room: String,
) -> Result<()> {
    init_tracing("info");

    let manager = Arc::new(load_manager(config_path)?);
    let notes = Arc::new(NoteBook::default());
    let engine = Arc::new(build_engine(manager.current(), notes.clone())?);
    spawn_config_listener(&manager, engine.clone());

    println!();
    println!("  genloop v{}", env!("CARGO_PKG_VERSION"));
    println!("  Commands: /reload  /pool  /notes  quit");
    println!();

    let stdin = io::stdin();
    loop {
        print!("you> ");
        io::stdout().flush().context("failed to flush stdout")?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line).context("failed to read input")? == 0 {
            break;
        }
        let trimmed = line.trim();

        match trimmed {
            "" => continue,
            "quit" | "exit" => {
                info!("user requested exit");
                break;
            }
            "/reload" => {
                match manager.reload() {
                    Ok(_) => println!("  configuration reloaded"),
                    Err(e) => println!("  reload failed, keeping current config: {e}"),
                }
                continue;
            }
            "/pool" => {
                print_pool(&engine);
                continue;
            }
            "/notes" => {
                for note in notes.for_user(&user) {
                    println!("  - {note}");
                }
                continue;
            }
            _ => {}
        }

        let mut request = GenerateRequest::new(user.clone(), room.clone(), Turn::user(trimmed));
        request.model = model.clone();
        let generation = engine.generate(request).await;
        print_generation(&generation);
    }

    info!("shutting down");
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: ask
// ---------------------------------------------------------------------------

async fn cmd_ask(config_path: &Path, message: String, model: Option<String>) -> Result<()> {
    init_tracing("warn");

    let manager = load_manager(config_path)?;
    let engine = build_engine(manager.current(), Arc::new(NoteBook::default()))?;

    let mut request = GenerateRequest::new("cli-user", "terminal", Turn::user(message));
    request.model = model;
    let generation = engine.generate(request).await;
    print_generation(&generation);
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: check-config
// ---------------------------------------------------------------------------

fn cmd_check_config(config_path: &Path) -> Result<()> {
    init_tracing("warn");

    let manager = load_manager(config_path)?;
    let config = manager.current();

    println!();
    println!("  genloop configuration");
    println!("  =====================");
    println!();
    match manager.path() {
        Some(path) => println!("  Source:            {}", path.display()),
        None => println!("  Source:            defaults + environment"),
    }
    println!("  Default model:     {}", config.default_model);
    println!("  Official base URL: {}", config.official.base_url);
    println!("  Credentials:       {}", config.official.credentials.len());
    println!("  Max tool rounds:   {}", config.max_tool_rounds);
    println!("  Max concurrent:    {}", config.max_concurrent_requests);
    match &config.override_endpoint {
        Some(alias) => println!("  Override endpoint: {alias}"),
        None => println!("  Override endpoint: (none)"),
    }
    for (alias, endpoint) in &config.endpoints {
        println!(
            "  Endpoint {alias}: {} model={} format={:?}",
            endpoint.url, endpoint.model, endpoint.wire_format
        );
    }
    if config.official.credentials.is_empty() {
        println!();
        println!("  [!] No credentials configured. Set GENLOOP_API_KEYS or");
        println!("      official.credentials in the config file.");
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: pool
// ---------------------------------------------------------------------------

fn cmd_pool(config_path: &Path) -> Result<()> {
    init_tracing("warn");

    let manager = load_manager(config_path)?;
    let engine = build_engine(manager.current(), Arc::new(NoteBook::default()))?;
    print_pool(&engine);
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Load the config file, or fall back to defaults plus environment when the
/// file does not exist.
fn load_manager(path: &Path) -> Result<ConfigManager> {
    if path.exists() {
        return ConfigManager::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()));
    }

    warn!(path = %path.display(), "config file not found, using defaults");
    let mut config = EngineConfig::default();
    config.apply_env_overrides();
    config.validate().context("invalid default configuration")?;
    Ok(ConfigManager::new(config))
}

fn build_engine(config: Arc<EngineConfig>, notes: Arc<NoteBook>) -> Result<Engine> {
    Engine::builder((*config).clone())
        .tools(tools::registry(notes))
        .history(Arc::new(InMemoryHistory::default()))
        .build()
        .context("failed to start engine (are any credentials configured?)")
}

/// Apply every configuration change to the running engine.
fn spawn_config_listener(manager: &ConfigManager, engine: Arc<Engine>) {
    let mut changes = manager.subscribe();
    tokio::spawn(async move {
        while let Ok(change) = changes.recv().await {
            let (ConfigChange::Reloaded(config) | ConfigChange::Replaced(config)) = change;
            if let Err(e) = engine.apply_config(config) {
                warn!(error = %e, "failed to apply configuration change");
            }
        }
    });
}

fn print_generation(generation: &Generation) {
    match &generation.outcome {
        Outcome::Reply(text) => println!("bot> {text}"),
        Outcome::Apology { kind, text } => println!("bot> {text}  [{kind:?}]"),
        Outcome::AlreadyDelivered => println!("  (delivered by a tool)"),
    }
    if !generation.tools_invoked.is_empty() {
        println!(
            "  tools: {}",
            generation
                .tools_invoked
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
    info!(
        rounds = generation.rounds,
        input_tokens = generation.usage.input_tokens,
        output_tokens = generation.usage.output_tokens,
        "generation finished"
    );
}

fn print_pool(engine: &Engine) {
    println!();
    println!("  {:<12} {:<14} {:>8} {:>9} {:>10}", "credential", "state", "penalty", "failures", "cooldown");
    for status in engine.pool_snapshot() {
        let cooldown = status
            .cooldown_remaining
            .map(|d| format!("{:.1}s", d.as_secs_f64()))
            .unwrap_or_else(|| "-".into());
        println!(
            "  {:<12} {:<14} {:>8} {:>9} {:>10}",
            status.label,
            status.state.to_string(),
            status.penalty,
            status.consecutive_failures,
            cooldown
        );
    }
    println!();
}

/// Initialize the tracing subscriber with the given default log level.
fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
