use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use fleet_api::{FleetApi, InProcApi, InstallParams, SearchTarget};
use fleet_core::{Kind, Labels, QueryOptions, Selector};
use fleet_manager::{Manager, ManagerConfig, Relayer};
use fleet_protocol::{AgentProtocol, ProtocolConfig};
use fleet_search::LatestVersion;
use fleet_store::{Backend, MemoryBackend, ResourceStore};
use serde::Serialize;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "fleetctl", version, about = "Fleet control plane")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(flatten)]
    store: StoreArgs,

    /// Prometheus listener, e.g. 0.0.0.0:9000
    #[arg(long = "metrics-addr", env = "FLEET_METRICS_ADDR", global = true)]
    metrics_addr: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json, Yaml }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum StoreKind { Memory, Sqlite }

#[derive(Args, Debug)]
struct StoreArgs {
    /// Storage backend
    #[arg(long = "store", value_enum, env = "FLEET_STORE", global = true, default_value_t = StoreKind::Sqlite)]
    kind: StoreKind,

    /// SQLite database path (default ~/.fleet/fleet.db)
    #[arg(long = "db-path", env = "FLEET_DB_PATH", global = true)]
    db_path: Option<PathBuf>,

    /// Agent version substituted for `version:latest` in agent queries
    #[arg(long = "latest-agent-version", env = "FLEET_LATEST_AGENT_VERSION", global = true)]
    latest_agent_version: Option<String>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Target { Agents, Configurations }

impl From<Target> for SearchTarget {
    fn from(t: Target) -> Self {
        match t {
            Target::Agents => SearchTarget::Agents,
            Target::Configurations => SearchTarget::Configurations,
        }
    }
}

#[derive(Args, Debug, Default)]
struct ListArgs {
    /// Label selector, e.g. "env=prod,app=web"
    #[arg(short = 'l', long = "selector")]
    selector: Option<String>,
    /// Search query
    #[arg(short = 'q', long = "query")]
    query: Option<String>,
    #[arg(long = "offset", default_value_t = 0)]
    offset: usize,
    /// 0 means no limit
    #[arg(long = "limit", default_value_t = 0)]
    limit: usize,
    /// Sort field, prefix with '-' for descending
    #[arg(long = "sort")]
    sort: Option<String>,
}

impl ListArgs {
    fn options(&self) -> Result<QueryOptions> {
        let mut opts = QueryOptions::new().with_offset(self.offset).with_limit(self.limit);
        if let Some(s) = &self.selector {
            opts = opts.with_selector(Selector::from_str(s).with_context(|| format!("parsing selector '{}'", s))?);
        }
        if let Some(q) = &self.query {
            opts = opts.with_query(q.clone());
        }
        if let Some(s) = &self.sort {
            opts = opts.with_sort(s.clone());
        }
        Ok(opts)
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the control plane: seed, reconcile, heartbeat, cleanup
    Serve(ServeArgs),
    /// Apply resources from a YAML file ("-" for stdin)
    Apply {
        file: PathBuf,
        /// Validate and show what would change without writing
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
    },
    /// Delete resources named in a YAML file, or one resource by kind and name
    Delete {
        #[arg(short = 'f', long = "file", conflicts_with = "kind")]
        file: Option<PathBuf>,
        #[arg(requires = "name")]
        kind: Option<String>,
        name: Option<String>,
    },
    /// Get one resource or list a kind
    Get {
        kind: String,
        name: Option<String>,
        #[command(flatten)]
        list: ListArgs,
    },
    /// Search agents or configurations
    Search {
        #[arg(value_enum)]
        target: Target,
        query: String,
        /// Print completions for the last token instead of results
        #[arg(long = "suggest", action = ArgAction::SetTrue)]
        suggest: bool,
    },
    /// Inspect and manage agents
    Agents {
        #[command(subcommand)]
        command: AgentCommands,
    },
    /// Print a one-line agent installer
    InstallCommand {
        #[arg(long = "platform", default_value = "linux")]
        platform: String,
        #[arg(long = "version", default_value = "")]
        version: String,
        #[arg(long = "endpoint", env = "FLEET_ENDPOINT")]
        endpoint: String,
        #[arg(long = "secret-key", env = "FLEET_SECRET_KEY")]
        secret_key: Option<String>,
        #[arg(long = "labels", default_value = "")]
        labels: String,
    },
}

#[derive(Subcommand, Debug)]
enum AgentCommands {
    /// List agents
    Ls {
        #[command(flatten)]
        list: ListArgs,
    },
    /// Show one agent and the configuration it should run
    Get { id: String },
    /// Merge labels into an agent
    Label {
        id: String,
        labels: String,
        #[arg(long = "overwrite", action = ArgAction::SetTrue)]
        overwrite: bool,
    },
    /// Remove agents
    Rm { ids: Vec<String> },
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Secret key agents must present; unset accepts any agent
    #[arg(long = "secret-key", env = "FLEET_SECRET_KEY")]
    secret_key: Option<String>,
    /// Folder with source-types/ and destination-types/ applied at startup
    #[arg(long = "seed-dir", env = "FLEET_SEED_DIR")]
    seed_dir: Option<PathBuf>,
    #[arg(long = "heartbeat-secs", default_value_t = 30)]
    heartbeat_secs: u64,
    /// Remove agents disconnected longer than this
    #[arg(long = "cleanup-ttl-secs")]
    cleanup_ttl_secs: Option<u64>,
    #[arg(long = "cleanup-interval-secs", default_value_t = 60)]
    cleanup_interval_secs: u64,
    /// Accepted protocol versions; empty accepts all
    #[arg(long = "protocol-versions", value_delimiter = ',', default_value = "v0.2.0")]
    protocol_versions: Vec<String>,
    #[arg(long = "send-timeout-ms", default_value_t = 10_000)]
    send_timeout_ms: u64,
    #[arg(long = "max-workers", default_value_t = 10)]
    max_workers: usize,
}

fn init_tracing() {
    let env = std::env::var("FLEET_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics(addr: Option<&str>) {
    let Some(addr) = addr else { return };
    if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
        let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
        match builder.with_http_listener(sock).install() {
            Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
            Err(e) => warn!(error = %e, "failed to install metrics exporter"),
        }
    } else {
        warn!(addr = %addr, "invalid FLEET_METRICS_ADDR; expected host:port");
    }
}

async fn open_store(args: &StoreArgs) -> Result<Arc<ResourceStore>> {
    let backend: Arc<dyn Backend> = match args.kind {
        StoreKind::Memory => Arc::new(MemoryBackend::new()),
        StoreKind::Sqlite => match &args.db_path {
            Some(p) => Arc::new(fleet_persist::SqliteBackend::open(p)?),
            None => Arc::new(fleet_persist::SqliteBackend::open_default()?),
        },
    };
    let mut builder = ResourceStore::builder(backend);
    if let Some(v) = args.latest_agent_version.as_deref().filter(|v| !v.is_empty()) {
        info!(version = v, "latest agent version set");
        builder = builder.version_provider(Arc::new(LatestVersion::new(v)));
    }
    Ok(Arc::new(builder.open().await?))
}

fn read_input(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut s = String::new();
        std::io::stdin().read_to_string(&mut s).context("reading stdin")?;
        return Ok(s);
    }
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

fn emit<T: Serialize>(output: Output, value: &T, human: impl FnOnce(&T)) -> Result<()> {
    match output {
        Output::Human => human(value),
        Output::Json => println!("{}", serde_json::to_string_pretty(value)?),
        Output::Yaml => print!("{}", serde_yaml::to_string(value)?),
    }
    Ok(())
}

async fn serve(store: Arc<ResourceStore>, args: ServeArgs) -> Result<()> {
    if let Some(dir) = &args.seed_dir {
        let report = fleet_apply::seed(&store, dir).await?;
        info!(files = report.files, applied = report.applied, failed = report.failed, "seed resources applied");
    }
    let protocol = Arc::new(AgentProtocol::new(
        Arc::clone(&store),
        ProtocolConfig {
            secret_key: args.secret_key.filter(|s| !s.is_empty()),
            compatible_versions: args.protocol_versions.into_iter().filter(|v| !v.is_empty()).collect(),
            send_timeout: Duration::from_millis(args.send_timeout_ms),
            heartbeat_interval: Duration::from_secs(args.heartbeat_secs.max(1)),
        },
    ));
    let relayer = Arc::new(Relayer::new(protocol.clone()));
    protocol.set_relayer(&relayer);

    let manager = Arc::new(Manager::new(
        Arc::clone(&store),
        ManagerConfig {
            max_workers: args.max_workers,
            cleanup_interval: Duration::from_secs(args.cleanup_interval_secs.max(1)),
            cleanup_ttl: args.cleanup_ttl_secs.map(Duration::from_secs),
            ..Default::default()
        },
    ));
    manager.add_protocol(protocol.clone());

    let ctx = CancellationToken::new();
    let reconcile = manager.start(ctx.clone()).await;
    let heartbeat = protocol.spawn_heartbeat(ctx.clone());
    info!("control plane running; Ctrl-C to stop");
    signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("shutting down");
    ctx.cancel();
    if let Err(e) = reconcile.await {
        warn!(error = %e, "manager task ended abnormally");
    }
    if let Err(e) = heartbeat.await {
        warn!(error = %e, "heartbeat task ended abnormally");
    }
    drop(relayer);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    init_metrics(cli.metrics_addr.as_deref());
    let output = cli.output;

    if let Commands::InstallCommand { platform, version, endpoint, secret_key, labels } = &cli.command {
        let params = InstallParams {
            platform: platform.clone(),
            version: version.clone(),
            endpoint: endpoint.clone(),
            secret_key: secret_key.clone(),
            labels: labels.parse::<Labels>()?,
        };
        println!("{}", fleet_api::install_command(&params)?);
        return Ok(());
    }

    let store = open_store(&cli.store).await?;
    let api = InProcApi::new(Arc::clone(&store));

    match cli.command {
        Commands::Serve(args) => serve(store, args).await?,
        Commands::Apply { file, dry_run } => {
            let yaml = read_input(&file)?;
            info!(file = %file.display(), dry_run, "apply invoked");
            if dry_run {
                let plan = api.dry_run(&yaml).await?;
                emit(output, &plan, |plan| {
                    for p in plan {
                        println!("{} {} {}", p.kind, p.name, serde_json::to_string(&p.planned).unwrap_or_default());
                    }
                })?;
            } else {
                let statuses = api.apply(&yaml).await?;
                emit(output, &statuses, |statuses| {
                    for s in statuses {
                        match &s.status {
                            fleet_core::UpdateStatus::Invalid(r) | fleet_core::UpdateStatus::Error(r) => {
                                println!("{} {} {}: {}", s.resource.kind(), s.resource.name(), s.status.label(), r)
                            }
                            other => println!("{} {} {}", s.resource.kind(), s.resource.name(), other.label()),
                        }
                    }
                })?;
            }
        }
        Commands::Delete { file, kind, name } => {
            let statuses = match (file, kind, name) {
                (Some(file), _, _) => api.delete(&read_input(&file)?).await?,
                (None, Some(kind), Some(name)) => vec![api.delete_resource(Kind::from_str(&kind)?, &name).await?],
                _ => anyhow::bail!("pass -f <file> or <kind> <name>"),
            };
            emit(output, &statuses, |statuses| {
                for s in statuses {
                    println!("{} {} {}", s.resource.kind(), s.resource.name(), s.status.label());
                }
            })?;
        }
        Commands::Get { kind, name, list } => {
            let kind = Kind::from_str(&kind)?;
            match name {
                Some(name) if kind == Kind::Agent => emit(output, &api.agent(&name).await?, |a| {
                    println!("{}\t{}\t{}\t{}", a.id, a.name, a.status, a.labels)
                })?,
                Some(name) => {
                    let r = api.get(kind, &name).await?;
                    match output {
                        Output::Human => print!("{}", serde_yaml::to_string(&r)?),
                        _ => emit(output, &r, |_| {})?,
                    }
                }
                None if kind == Kind::Agent => {
                    let page = api.agents(&list.options()?).await?;
                    emit(output, &page, print_agents)?;
                }
                None => {
                    let items = api.list(kind, &list.options()?).await?;
                    emit(output, &items, |items| {
                        for r in items {
                            println!("{}\t{}\t{}", r.kind(), r.name(), r.id());
                        }
                    })?;
                }
            }
        }
        Commands::Search { target, query, suggest } => {
            if suggest {
                for s in api.suggestions(target.into(), &query).await? {
                    println!("{}\t{}", s.label, s.query);
                }
            } else {
                let ids = api.search(target.into(), &query).await?;
                emit(output, &ids, |ids| ids.iter().for_each(|id| println!("{}", id)))?;
            }
        }
        Commands::Agents { command } => match command {
            AgentCommands::Ls { list } => {
                let page = api.agents(&list.options()?).await?;
                emit(output, &page, print_agents)?;
            }
            AgentCommands::Get { id } => {
                let agent = api.agent(&id).await?;
                let configuration = api.agent_configuration(&id).await?.map(|c| c.metadata.name);
                let view = serde_json::json!({ "agent": agent, "configuration": configuration });
                emit(output, &view, |_| {
                    println!("id:            {}", agent.id);
                    println!("name:          {}", agent.name);
                    println!("status:        {}", agent.status);
                    println!("version:       {}", agent.version);
                    println!("labels:        {}", agent.labels);
                    println!("configuration: {}", configuration.as_deref().unwrap_or("-"));
                })?;
            }
            AgentCommands::Label { id, labels, overwrite } => {
                let labels: Labels = labels.parse()?;
                match api.patch_agent_labels(&id, &labels, overwrite).await {
                    Ok(agent) => emit(output, &agent, |a| println!("{}\t{}", a.id, a.labels))?,
                    Err(e) => {
                        error!(agent_id = %id, error = %e, "label patch failed");
                        anyhow::bail!("{} (http {})", e, e.status().as_u16());
                    }
                }
            }
            AgentCommands::Rm { ids } => {
                let removed = api.delete_agents(&ids).await?;
                emit(output, &removed, |removed| removed.iter().for_each(|a| println!("{} deleted", a.id)))?;
            }
        },
        Commands::InstallCommand { .. } => {}
    }
    Ok(())
}

fn print_agents(page: &fleet_api::AgentsPage) {
    for a in &page.agents {
        println!("{}\t{}\t{}\t{}\t{}", a.id, a.name, a.status, a.version, a.labels);
    }
    println!("({} of {})", page.agents.len(), page.total);
}
