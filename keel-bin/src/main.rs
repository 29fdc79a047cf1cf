mod builtins;

use clap::{Parser, Subcommand};
use parking_lot::RwLock;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use keel_config::{ConfigLoader, KeelConfig};
use keel_core::{Event, EventRegistry};
use keel_kernel::{
    Aggregates, AppProjection, CommandProcessor, EventBus, RecoveryManager,
};
use keel_llm::{LlmClient, MockClient, OpenAiClient};
use keel_plugin::{discover, is_stale, PluginLoader, PluginRegistry, StaticHost};
use keel_runtime::{Orchestrator, RequestProjection};
use keel_store::{EventLog, MemoryLog, SqliteLog};

#[derive(Parser)]
#[command(name = "keel", version, about = "Event-sourced agent kernel")]
struct Cli {
    /// Path to keel.toml (default: ~/.keel/keel.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive request loop (default)
    Run,
    /// Execute one command through the synchronous processor
    Exec {
        /// Command name, e.g. "status"
        command: String,
        /// JSON input object
        #[arg(default_value = "{}")]
        input: String,
    },
    /// Print the persisted event log
    Events,
    /// List discovered plugin units and their build state
    Plugins,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = ConfigLoader::load(cli.config.as_deref())?.get();
    init_logging(&config);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(&config).await,
        Commands::Exec { command, input } => exec(&config, &command, &input).await,
        Commands::Events => print_events(&config),
        Commands::Plugins => print_plugins(&config),
    }
}

fn init_logging(config: &KeelConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.logging.format.as_str() {
        "json" => builder.json().init(),
        "compact" => builder.compact().init(),
        _ => builder.init(),
    }
}

// ── Kernel assembly ────────────────────────────────────────────

struct Kernel {
    bus: Arc<EventBus>,
    processor: CommandProcessor,
    // Subscribed closures hold their own Arcs; kept for clarity.
    _orchestrator: Arc<Orchestrator>,
}

fn open_store(config: &KeelConfig) -> anyhow::Result<Arc<dyn EventLog>> {
    let registry = Arc::new(EventRegistry::with_kernel_events());
    if config.kernel.event_log == Path::new("memory") {
        Ok(Arc::new(MemoryLog::new()))
    } else {
        Ok(Arc::new(SqliteLog::open(&config.kernel.event_log, registry)?))
    }
}

fn build_kernel(config: &KeelConfig) -> anyhow::Result<Kernel> {
    let store = open_store(config)?;

    // Built-ins first: on a command name collision the built-in wins.
    let mut plugins = PluginRegistry::new();
    plugins.add(Arc::new(builtins::KernelPlugin));
    plugins.add(Arc::new(builtins::AssistantPlugin::new(&config.kernel.model)));

    // External units. The static host resolves entrypoints registered by
    // embedders; unmatched units are built (warming the cache) but skipped.
    let mut loader = PluginLoader::new(
        Arc::new(StaticHost::new()),
        config.plugins.build_command.clone(),
    );
    loader.autobuild = config.plugins.autobuild;
    let loaded = loader.load_all(&config.plugins.dir, &mut plugins)?;
    if !loaded.is_empty() {
        info!(units = ?loaded, "external plugin units loaded");
    }

    let surface = plugins.merge();

    let aggregates = Aggregates::new();
    aggregates.register(Arc::new(RwLock::new(AppProjection::new())));
    aggregates.register(Arc::new(RwLock::new(RequestProjection::new())));

    let recovery = Arc::new(RecoveryManager::new(
        Duration::from_secs(config.recovery.window_secs),
        config.recovery.threshold,
    ));

    let bus = EventBus::new(store, aggregates, Arc::clone(&surface.commands), recovery);
    let replayed = bus.replay()?;
    if replayed > 0 {
        info!(events = replayed, "state rebuilt from event log");
    }

    // Plugin event handlers become bus subscribers.
    for (plugin, kind, handler) in surface.subscriptions {
        let label = format!("plugin:{plugin}");
        bus.subscribe(
            &label,
            &kind,
            Arc::new(move |event, ctx| {
                let handler = Arc::clone(&handler);
                Box::pin(async move { handler(&event, &ctx.snapshot) })
            }),
        );
    }

    let registered: Vec<Event> = plugins
        .plugins()
        .iter()
        .map(|p| Event::PluginLoaded {
            plugin: p.name().to_string(),
            kind: p.kind().as_str().to_string(),
        })
        .collect();
    bus.publish(&registered)?;

    let orchestrator = Orchestrator::new(
        llm_client(config)?,
        surface.agents.clone(),
        &config.kernel.model,
    );
    orchestrator.attach(&bus);

    let processor = CommandProcessor::new(Arc::clone(&bus));

    Ok(Kernel {
        bus,
        processor,
        _orchestrator: orchestrator,
    })
}

fn llm_client(config: &KeelConfig) -> anyhow::Result<Arc<dyn LlmClient>> {
    match config.llm.provider.as_str() {
        "mock" => Ok(Arc::new(MockClient::new())),
        _ => {
            let api_key = config.llm.api_key.clone().unwrap_or_default();
            if api_key.is_empty() {
                warn!("no API key configured; LLM calls will be rejected by the provider");
            }
            let mut client = OpenAiClient::new(api_key);
            if let Some(url) = &config.llm.base_url {
                client = client.with_base_url(url.clone(), "openai-compatible".into());
            }
            Ok(Arc::new(client))
        }
    }
}

// ── Subcommands ────────────────────────────────────────────────

async fn run(config: &KeelConfig) -> anyhow::Result<()> {
    let kernel = build_kernel(config)?;
    let mut watch = kernel.bus.watch();

    println!("keel ready — type a request, Ctrl-D to exit");
    let stdin = std::io::stdin();
    let mut line = String::new();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        line.clear();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let text = line.trim();
        if text.is_empty() {
            continue;
        }

        let request_id = uuid::Uuid::new_v4().to_string();
        kernel.bus.publish(&[Event::UserRequestReceived {
            request_id: request_id.clone(),
            text: text.to_string(),
        }])?;

        loop {
            match watch.recv().await {
                Ok(Event::RequestCompleted {
                    request_id: rid,
                    text,
                    is_error,
                }) if rid == request_id => {
                    if is_error {
                        eprintln!("error: {text}");
                    } else {
                        println!("{text}");
                    }
                    break;
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(_) => return Ok(()),
            }
        }
    }
    Ok(())
}

async fn exec(config: &KeelConfig, command: &str, input: &str) -> anyhow::Result<()> {
    let kernel = build_kernel(config)?;
    let input: serde_json::Value = serde_json::from_str(input)?;
    let output = kernel.processor.execute_command(command, input)?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn print_events(config: &KeelConfig) -> anyhow::Result<()> {
    let store = open_store(config)?;
    for (i, event) in store.events()?.iter().enumerate() {
        let (kind, payload) = event.encode()?;
        println!("{i:>6}  {kind}  {payload}");
    }
    Ok(())
}

fn print_plugins(config: &KeelConfig) -> anyhow::Result<()> {
    let units = discover(&config.plugins.dir)?;
    if units.is_empty() {
        println!("no plugin units under {}", config.plugins.dir.display());
        return Ok(());
    }
    for unit in units {
        let state = match is_stale(&unit) {
            Ok(true) => "stale",
            Ok(false) => "built",
            Err(_) => "unknown",
        };
        println!(
            "{}  {}  v{}  [{}]",
            unit.name, unit.manifest.plugin.kind, unit.manifest.plugin.version, state
        );
    }
    Ok(())
}
