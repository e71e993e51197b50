use clap::Parser;
use pkg_constants::lease::{DEFAULT_LEADERSHIP_DURATION, DEFAULT_MAX_SLEEP, GLOBAL_CLOCK_UPDATE_INTERVAL};
use pkg_constants::paths::{DEFAULT_AGENT_CONFIG, DEFAULT_AGENT_DATA_DIR};
use pkg_leadership::{Claimer, LeaderElection, namespace_config};
use pkg_lease::{GlobalClockUpdater, GlobalClockWorker, Manager, ManagerConfig, SystemClock};
use pkg_state::StateStore;
use pkg_types::config::AgentConfigFile;
use pkg_types::validate::validate_unit_name;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "leadership-agent", about = "Claims and holds application leadership for one unit")]
struct Cli {
    /// Path to YAML config file
    #[arg(long, short, default_value = DEFAULT_AGENT_CONFIG)]
    config: String,

    /// Directory for SlateDB state storage
    #[arg(long)]
    data_dir: Option<String>,

    /// Identity written into lease documents (defaults to a random id)
    #[arg(long)]
    writer_id: Option<String>,

    /// Unit to make leader, e.g. `mysql/0`
    #[arg(long)]
    unit: Option<String>,

    /// Leadership lease duration in seconds
    #[arg(long)]
    lease_duration_secs: Option<u64>,

    /// Longest the lease manager sleeps between expiry sweeps
    #[arg(long)]
    max_sleep_secs: Option<u64>,

    /// Also advance the global clock from this process
    #[arg(long)]
    global_clock: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let cli = Cli::parse();

    // Load config file (returns defaults if file not found)
    let file_cfg = AgentConfigFile::load(&cli.config)?;
    info!("Config file: {}", cli.config);

    // Merge: CLI args > config file > defaults
    let data_dir = cli
        .data_dir
        .or(file_cfg.data_dir)
        .unwrap_or_else(|| DEFAULT_AGENT_DATA_DIR.to_string());
    let writer_id = cli
        .writer_id
        .or(file_cfg.writer_id)
        .unwrap_or_else(|| format!("agent-{}", uuid::Uuid::new_v4().simple()));
    let Some(unit) = cli.unit.or(file_cfg.unit) else {
        anyhow::bail!("no unit given: pass --unit or set `unit` in {}", cli.config);
    };
    validate_unit_name(&unit)?;
    let duration = cli
        .lease_duration_secs
        .or(file_cfg.lease_duration_secs)
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_LEADERSHIP_DURATION);
    let max_sleep = cli
        .max_sleep_secs
        .or(file_cfg.max_sleep_secs)
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_MAX_SLEEP);

    info!("Starting leadership-agent");
    info!("  Data dir:  {}", data_dir);
    info!("  Writer:    {}", writer_id);
    info!("  Unit:      {}", unit);
    info!("  Duration:  {}s", duration.as_secs());

    let state = StateStore::new(&data_dir).await?;
    let store = Arc::new(state.clone());

    let mut config = ManagerConfig::new(writer_id, store.clone(), Arc::new(SystemClock))
        .with_max_sleep(max_sleep);
    config.namespaces.push(namespace_config());
    let manager = Manager::start(config).await?;

    let (dying, dying_rx) = watch::channel(false);
    let clock_task = if cli.global_clock {
        let updater = GlobalClockUpdater::new(store).await?;
        Some(GlobalClockWorker::new(updater, GLOBAL_CLOCK_UPDATE_INTERVAL, dying_rx.clone()).start())
    } else {
        None
    };

    let election = LeaderElection::new(Claimer::new(&manager)?, &unit, duration)?;
    let (election_task, _leader) = election.start(dying_rx);

    tokio::signal::ctrl_c().await?;
    info!("Shutting down leadership-agent");
    dying.send_replace(true);
    election_task.await?;
    if let Some(task) = clock_task {
        task.await?;
    }
    manager.stop().await?;
    state.close().await?;
    Ok(())
}
