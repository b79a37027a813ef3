//! speedtest-nextgen - terminal front-end for SpeedtestNextGen
//!
//! Composition root: builds the settings manager, result store, log collector
//! and engine factory once, then hands them down by `Arc`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::Receiver;
use serde_json::Value;

use speedtest_nextgen::config::loader;
use speedtest_nextgen::engine::DEFAULT_SERVER_LIMIT;
use speedtest_nextgen::{
    DefaultEngineFactory, EngineFactory, LogCollector, MeasurementResult, ResultStore, RunKind,
    SettingsManager, SpeedUnit, SpeedtestService, TestEvent, TestRunner, VERSION,
};

/// speedtest-nextgen - network speed tests over the built-in engine or the Ookla CLI
#[derive(Parser, Debug)]
#[command(name = "speedtest-nextgen")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Data directory holding settings.json, data/ and logs/
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Session log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a single speed test
    Run {
        /// Server ID to test against (overrides the configured server)
        #[arg(long)]
        server: Option<u32>,
    },

    /// Run three tests on different servers and store the average
    Precise,

    /// List servers of the configured engine
    Servers {
        /// Maximum number of servers
        #[arg(short = 'n', long, default_value_t = DEFAULT_SERVER_LIMIT)]
        limit: usize,
    },

    /// Show or manage stored results
    History {
        /// Show only the most recent N records
        #[arg(short = 'n', long)]
        limit: Option<usize>,

        /// Remove every stored record
        #[arg(long, conflicts_with_all = ["limit", "count"])]
        clear: bool,

        /// Print the number of stored records
        #[arg(long, conflicts_with = "limit")]
        count: bool,
    },

    /// Settings document
    #[command(subcommand)]
    Settings(SettingsCommands),

    /// Favorite servers used by the precise test
    #[command(subcommand)]
    Favorites(FavoritesCommands),
}

#[derive(Subcommand, Debug)]
enum SettingsCommands {
    /// Print every setting
    Show,

    /// Print one setting
    Get {
        key: String,
    },

    /// Change one setting (the value is parsed as JSON, bare words as strings)
    Set {
        key: String,
        value: String,
    },
}

#[derive(Subcommand, Debug)]
enum FavoritesCommands {
    /// Add a favorite server ID
    Add { id: u32 },

    /// Remove a favorite server ID
    Remove { id: u32 },
}

struct AppPaths {
    settings: PathBuf,
    results: PathBuf,
    logs: PathBuf,
}

impl AppPaths {
    fn resolve(data_dir: Option<&Path>) -> Self {
        match data_dir {
            Some(dir) => AppPaths {
                settings: dir.join(loader::SETTINGS_FILENAME),
                results: dir.join("data").join(loader::RESULTS_FILENAME),
                logs: dir.join("logs"),
            },
            None => AppPaths {
                settings: loader::default_settings_path(),
                results: loader::default_results_path(),
                logs: loader::default_logs_dir(),
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let paths = AppPaths::resolve(cli.data_dir.as_deref());
    let log_level = cli.log_level.parse::<log::LevelFilter>().unwrap_or_else(|_| {
        eprintln!("warning: unknown log level '{}', using info", cli.log_level);
        log::LevelFilter::Info
    });

    // =========================================================================
    // LOGGING INITIALIZATION - MUST BE FIRST
    // =========================================================================
    let collector = match LogCollector::new(&paths.logs, None, log_level) {
        Ok(collector) => {
            let handle = collector.clone();
            if let Err(e) = collector.install() {
                eprintln!("warning: failed to register session logger: {}", e);
            }
            Some(handle)
        }
        Err(e) => {
            eprintln!("warning: session logging disabled: {}", e);
            None
        }
    };
    log::info!(target: "app", "SpeedtestNextGen {} starting", VERSION);

    // =========================================================================
    // SHARED SERVICES
    // =========================================================================
    let settings = Arc::new(
        SettingsManager::load(&paths.settings)
            .with_context(|| format!("failed to load settings from {}", paths.settings.display()))?,
    );
    let store = Arc::new(ResultStore::new(&paths.results));
    let engines: Arc<dyn EngineFactory> = Arc::new(DefaultEngineFactory::new());
    let service = SpeedtestService::new(Arc::clone(&settings), Arc::clone(&store), engines);

    let outcome = dispatch(cli.command, service).await;
    if let Err(e) = &outcome {
        log::error!(target: "app", "{:#}", e);
    }

    // =========================================================================
    // SHUTDOWN
    // =========================================================================
    if let Some(collector) = collector {
        if let Err(e) = collector.flush_pending() {
            eprintln!("warning: {}", e);
        }
    }
    outcome
}

async fn dispatch(command: Commands, service: SpeedtestService) -> Result<()> {
    match command {
        Commands::Run { server } => run_test(service, RunKind::Single { server_id: server }).await,
        Commands::Precise => run_test(service, RunKind::Precise).await,
        Commands::Servers { limit } => list_servers(&service, limit).await,
        Commands::History { limit, clear, count } => {
            let units = service.settings().snapshot().units;
            history(service.store(), units, limit, clear, count)
        }
        Commands::Settings(cmd) => settings_command(service.settings(), cmd),
        Commands::Favorites(cmd) => {
            let settings = service.settings();
            match cmd {
                FavoritesCommands::Add { id } => settings.add_favorite(id)?,
                FavoritesCommands::Remove { id } => settings.remove_favorite(id)?,
            }
            println!("Favorites: {:?}", settings.snapshot().favorite_server_ids);
            Ok(())
        }
    }
}

// ============================================================================
// TEST RUNS
// ============================================================================

async fn run_test(service: SpeedtestService, kind: RunKind) -> Result<()> {
    let units = service.settings().snapshot().units;
    let runner = Arc::new(TestRunner::new(service, kind));
    let events = runner.events();
    runner.start();

    let cancel_handle = Arc::clone(&runner);
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Canceling...");
            cancel_handle.cancel();
        }
    });

    let outcome = tokio::task::spawn_blocking(move || drain_events(&events, units))
        .await
        .context("event loop panicked")?;
    ctrl_c.abort();
    runner.wait();
    outcome
}

/// Print events until `Finished`; the run's error, if any, becomes the exit status.
fn drain_events(events: &Receiver<TestEvent>, units: SpeedUnit) -> Result<()> {
    let mut failure: Option<String> = None;
    for event in events.iter() {
        match event {
            TestEvent::StageChanged(stage) => println!("[{}]", stage),
            TestEvent::Log(line) => println!("{}", line),
            TestEvent::ResultReady(result) => print_result(&result, units),
            TestEvent::Error(msg) => {
                eprintln!("error: {}", msg);
                failure = Some(msg);
            }
            TestEvent::Canceled => println!("Test canceled"),
            TestEvent::Warning(msg) => eprintln!("warning: {}", msg),
            TestEvent::Finished => break,
        }
    }
    match failure {
        Some(msg) => Err(anyhow!(msg)),
        None => Ok(()),
    }
}

fn print_result(result: &MeasurementResult, units: SpeedUnit) {
    println!();
    println!("  Ping:     {:.1} ms", result.ping_ms);
    println!("  Download: {}", units.format(result.download_bps));
    println!("  Upload:   {}", units.format(result.upload_bps));
    if let Some(server) = &result.server {
        println!("  Server:   {}", server.describe());
    }
    if let Some(samples) = result.samples {
        println!("  Samples:  {}", samples);
    }
}

// ============================================================================
// DIRECTORY, HISTORY, SETTINGS
// ============================================================================

async fn list_servers(service: &SpeedtestService, limit: usize) -> Result<()> {
    let (_, engine) = service.select_engine();
    let servers = engine
        .list_servers(limit)
        .await
        .with_context(|| format!("failed to list {} servers", engine.kind().display_name()))?;

    for server in &servers {
        let id = server.id.map(|id| id.to_string()).unwrap_or_default();
        println!("{:>7}  {} - {}, {} ({})", id, server.sponsor, server.name, server.country, server.host);
    }
    println!("{} server(s)", servers.len());
    Ok(())
}

fn history(store: &ResultStore, units: SpeedUnit, limit: Option<usize>, clear: bool, count: bool) -> Result<()> {
    if clear {
        store.clear()?;
        println!("History cleared");
        return Ok(());
    }
    if count {
        println!("{}", store.count()?);
        return Ok(());
    }

    for record in store.load(limit)? {
        let engine = record.engine.map(|e| e.as_str()).unwrap_or("-");
        let mut line = format!("{}  {}  [{}]", record.timestamp, record.summary(units), engine);
        if record.is_aggregate() {
            line.push_str(&format!(" average of {}", record.samples.unwrap_or(0)));
        }
        println!("{}", line);
    }
    Ok(())
}

fn settings_command(settings: &SettingsManager, cmd: SettingsCommands) -> Result<()> {
    match cmd {
        SettingsCommands::Show => {
            let map = settings.snapshot().to_map()?;
            println!("{}", serde_json::to_string_pretty(&Value::Object(map))?);
        }
        SettingsCommands::Get { key } => match settings.get(&key) {
            Some(value) => println!("{}", value),
            None => bail!("unknown setting '{}'", key),
        },
        SettingsCommands::Set { key, value } => {
            let parsed = serde_json::from_str::<Value>(&value).unwrap_or(Value::String(value));
            settings.set(&key, parsed)?;
            println!("{} = {}", key, settings.get(&key).unwrap_or(Value::Null));
        }
    }
    Ok(())
}
