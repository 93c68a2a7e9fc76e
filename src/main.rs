use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use regulens_core::clock::SystemClock;
use regulens_core::config::RegulensConfig;
use regulens_core::consensus::ConsensusEngine;
use regulens_core::http::ReqwestFetcher;
use regulens_core::messenger::Messenger;
use regulens_core::monitor::Monitor;
use regulens_core::simulator::{RunRequest, Simulator};
use regulens_core::store::sqlite::SqliteStore;
use regulens_core::store::Store;
use regulens_core::types::{RegulatorySource, SourceType, VotingAlgorithm};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "regulens")]
#[command(about = "Multi-agent coordination fabric for regulatory-compliance automation")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the SQLite database file (defaults to the configured path)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Regulatory Monitor operations
    Monitor {
        #[command(subcommand)]
        action: MonitorAction,
    },
    /// Inter-Agent Messenger operations
    Messenger {
        #[command(subcommand)]
        action: MessengerAction,
    },
    /// Consensus Engine operations
    Consensus {
        #[command(subcommand)]
        action: ConsensusAction,
    },
    /// Regulatory Simulator operations
    Simulator {
        #[command(subcommand)]
        action: SimulatorAction,
    },
    /// Print the effective configuration and verify it is valid
    HealthCheck,
}

#[derive(Subcommand)]
enum MonitorAction {
    /// Register a regulatory source to watch
    AddSource {
        id: String,
        base_url: String,
        #[arg(value_enum, default_value = "rss")]
        source_type: SourceTypeArg,
    },
    /// List configured regulatory sources
    ListSources,
    /// Run one monitoring sweep over due sources and exit
    SweepOnce,
    /// Print the most recently detected regulatory items
    RecentItems {
        #[arg(default_value_t = 20)]
        limit: usize,
    },
    /// Print monitor statistics
    Stats,
}

#[derive(clap::ValueEnum, Clone)]
enum SourceTypeArg {
    Rss,
    Api,
    Html,
}

impl From<SourceTypeArg> for SourceType {
    fn from(value: SourceTypeArg) -> Self {
        match value {
            SourceTypeArg::Rss => SourceType::Rss,
            SourceTypeArg::Api => SourceType::Api,
            SourceTypeArg::Html => SourceType::Html,
        }
    }
}

#[derive(Subcommand)]
enum MessengerAction {
    /// Send a message from one agent to another (or broadcast if `to` is omitted)
    Send {
        from: String,
        message_type: String,
        /// JSON-encoded message content
        content: String,
        #[arg(long)]
        to: Option<String>,
        #[arg(long, default_value_t = 3)]
        priority: u8,
    },
    /// Receive pending messages addressed to an agent
    Receive {
        agent: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Acknowledge a delivered message
    Acknowledge { message_id: String, agent: String },
    /// Print messenger statistics
    Stats,
}

#[derive(Subcommand)]
enum ConsensusAction {
    /// Initiate a consensus process over a topic
    Initiate {
        topic: String,
        participants: Vec<String>,
        #[arg(long, default_value = "majority")]
        algorithm: String,
    },
    /// Print the current state of a consensus process
    State { process_id: String },
    /// Print consensus statistics
    Stats,
}

#[derive(Subcommand)]
enum SimulatorAction {
    /// Run a regulatory-impact simulation for an existing scenario
    Run {
        scenario_id: String,
        user_id: String,
        #[arg(long)]
        async_execution: bool,
    },
    /// List simulation scenarios owned by a user
    ListScenarios { user_id: String },
    /// Print the status of a running or completed simulation
    Status { execution_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;

    info!("starting regulens-core");
    let config = RegulensConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    config.validate().context("configuration is invalid")?;

    let db_path = cli.db.clone().unwrap_or_else(|| PathBuf::from(&config.database.path));
    let store: Arc<dyn Store> = Arc::new(
        SqliteStore::open(&db_path)
            .await
            .with_context(|| format!("failed to open database at {db_path:?}"))?,
    );
    store.initialize().await.context("failed to initialize schema")?;

    let clock = Arc::new(SystemClock);

    match cli.command {
        Commands::Monitor { action } => run_monitor(action, store, clock, &config).await?,
        Commands::Messenger { action } => run_messenger(action, store, clock, &config).await?,
        Commands::Consensus { action } => run_consensus(action, store, clock).await?,
        Commands::Simulator { action } => run_simulator(action, store, clock, &config).await?,
        Commands::HealthCheck => {
            println!("configuration OK");
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

async fn run_monitor(action: MonitorAction, store: Arc<dyn Store>, clock: Arc<SystemClock>, config: &RegulensConfig) -> Result<()> {
    let fetcher = Arc::new(ReqwestFetcher::new());
    let monitor = Monitor::new(store, clock, fetcher, config.monitor.clone());
    match action {
        MonitorAction::AddSource { id, base_url, source_type } => {
            monitor
                .add_source(RegulatorySource {
                    name: id.clone(),
                    id,
                    base_url,
                    source_type: source_type.into(),
                    check_interval_minutes: ((config.monitor.monitoring_interval_seconds / 60) as i64).max(1),
                    active: true,
                    scraping_config: serde_json::json!({}),
                    last_check: chrono::DateTime::<chrono::Utc>::from_timestamp(0, 0).unwrap_or_else(chrono::Utc::now),
                    consecutive_failures: 0,
                })
                .await?;
            println!("source added");
        }
        MonitorAction::ListSources => {
            let sources = monitor.list_sources().await?;
            println!("{}", serde_json::to_string_pretty(&sources)?);
        }
        MonitorAction::SweepOnce => {
            monitor.run_sweep_once().await?;
            let stats = monitor.stats().await?;
            if stats.active_sources == 0 {
                warn!("sweep complete but no active sources are configured");
            }
            println!("sweep complete");
        }
        MonitorAction::RecentItems { limit } => {
            let items = monitor.get_recent_items(limit).await?;
            println!("{}", serde_json::to_string_pretty(&items)?);
        }
        MonitorAction::Stats => {
            println!("{:#?}", monitor.stats().await?);
        }
    }
    Ok(())
}

async fn run_messenger(action: MessengerAction, store: Arc<dyn Store>, clock: Arc<SystemClock>, config: &RegulensConfig) -> Result<()> {
    let messenger = Messenger::new(store, clock, config.messenger.clone());
    match action {
        MessengerAction::Send { from, message_type, content, to, priority } => {
            let content: serde_json::Value = serde_json::from_str(&content).context("content must be valid JSON")?;
            let id = messenger
                .send(&from, to.as_deref(), &message_type, content, priority, None, None, None)
                .await?;
            println!("{id}");
        }
        MessengerAction::Receive { agent, limit } => {
            let messages = messenger.receive(&agent, limit, None).await?;
            println!("{}", serde_json::to_string_pretty(&messages)?);
        }
        MessengerAction::Acknowledge { message_id, agent } => {
            messenger.acknowledge(&message_id, &agent).await?;
            println!("acknowledged");
        }
        MessengerAction::Stats => {
            println!("{:#?}", messenger.stats().await?);
        }
    }
    Ok(())
}

async fn run_consensus(action: ConsensusAction, store: Arc<dyn Store>, clock: Arc<SystemClock>) -> Result<()> {
    let engine = ConsensusEngine::new(store, clock);
    match action {
        ConsensusAction::Initiate { topic, participants, algorithm } => {
            let algorithm = parse_algorithm(&algorithm)?;
            let cfg = engine.default_config(topic, participants, algorithm);
            let id = engine.initiate(cfg).await?;
            println!("{id}");
        }
        ConsensusAction::State { process_id } => {
            let state = engine.get_state(&process_id).await?;
            println!("{state:?}");
        }
        ConsensusAction::Stats => {
            println!("{:#?}", engine.stats());
        }
    }
    Ok(())
}

fn parse_algorithm(s: &str) -> Result<VotingAlgorithm> {
    match s.to_lowercase().as_str() {
        "unanimous" => Ok(VotingAlgorithm::Unanimous),
        "majority" => Ok(VotingAlgorithm::Majority),
        "super_majority" | "super-majority" => Ok(VotingAlgorithm::SuperMajority),
        "weighted_majority" | "weighted-majority" => Ok(VotingAlgorithm::WeightedMajority),
        "ranked_choice" | "ranked-choice" => Ok(VotingAlgorithm::RankedChoice),
        "quorum" => Ok(VotingAlgorithm::Quorum),
        "consensus" => Ok(VotingAlgorithm::Consensus),
        "plurality" => Ok(VotingAlgorithm::Plurality),
        other => anyhow::bail!("unknown voting algorithm: {other}"),
    }
}

async fn run_simulator(action: SimulatorAction, store: Arc<dyn Store>, clock: Arc<SystemClock>, config: &RegulensConfig) -> Result<()> {
    let simulator = Simulator::new(store, clock, config.simulator.max_concurrent_simulations);
    match action {
        SimulatorAction::Run { scenario_id, user_id, async_execution } => {
            let request = RunRequest {
                scenario_id,
                user_id,
                custom_parameters: None,
                test_data_override: None,
                async_execution,
                priority: 3,
            };
            let execution_id = simulator.run_simulation(request).await?;
            println!("{execution_id}");
        }
        SimulatorAction::ListScenarios { user_id } => {
            let scenarios = simulator.list_scenarios(Some(&user_id), 50, 0).await?;
            println!("{}", serde_json::to_string_pretty(&scenarios)?);
        }
        SimulatorAction::Status { execution_id } => {
            let status = simulator.get_execution_status(&execution_id).await?;
            println!("{status:?}");
        }
    }
    Ok(())
}

fn init_tracing(log_level: &str) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("failed to create env filter")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true),
        )
        .with(env_filter)
        .init();

    Ok(())
}
