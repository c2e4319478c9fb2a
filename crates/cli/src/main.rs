use std::io::Read;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use brine_core::{GraphRepository, Metadata, RelationKind, Resource, ResourceKind};
use brine_ops::{Action, BrineOps, SaltOps};
use brine_persist::SqliteGraph;
use brine_saltapi::SaltApiClient;
use brine_store::MemoryGraph;
use brine_sync::{rollup, CycleReport, Reconciler, SyncConfig, DEFAULT_KINDS};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use serde_json::Value as Json;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "brinectl", version, about = "Brine CLI: salt master state as a resource graph")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace resources are read from and written to
    #[arg(long = "ns", global = true, env = "BRINE_NAMESPACE", default_value = "default")]
    namespace: String,

    /// SQLite database path (default: ~/.brine/brine.db)
    #[arg(long = "db", global = true, env = "BRINE_DB_PATH")]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reconcile the salt master into the graph
    Sync {
        /// Kinds to fetch (repeatable); host, service and state_application by default
        #[arg(long = "kind")]
        kinds: Vec<String>,
        /// Keep running, one cycle every SECS seconds
        #[arg(long = "interval")]
        interval: Option<u64>,
        /// Use an in-memory graph instead of the database
        #[arg(long = "ephemeral", action = ArgAction::SetTrue)]
        ephemeral: bool,
    },
    /// List resources of one kind
    Ls { kind: String },
    /// Show one resource with its relations
    Show { kind: String, uid: String },
    /// Record a state-apply return event (JSON file, or - for stdin)
    Event { source: String },
    /// Input fields an action takes on a resource
    Fields { kind: String, uid: String, action: String },
    /// Run an action on a resource
    Run {
        kind: String,
        uid: String,
        action: String,
        /// Input value as key=value (repeatable)
        #[arg(long = "set")]
        set: Vec<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("BRINE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("BRINE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid BRINE_METRICS_ADDR; expected host:port");
        }
    }
}

fn open_repo(db: Option<&str>, ephemeral: bool) -> Result<Arc<dyn GraphRepository>> {
    if ephemeral {
        return Ok(Arc::new(MemoryGraph::new()));
    }
    let graph = match db {
        Some(path) => SqliteGraph::open(path)?,
        None => SqliteGraph::open_default()?,
    };
    Ok(Arc::new(graph))
}

fn parse_kind(raw: &str) -> Result<ResourceKind> {
    Ok(raw.parse::<ResourceKind>()?)
}

/// `key=value` pairs into an input mapping; values stay strings.
fn parse_set(pairs: &[String]) -> Result<Metadata> {
    let mut out = Metadata::new();
    for pair in pairs {
        let (key, value) = pair.split_once('=').ok_or_else(|| anyhow!("--set expects key=value, got {:?}", pair))?;
        out.insert(key.trim().to_string(), Json::String(value.to_string()));
    }
    Ok(out)
}

fn read_events(source: &str) -> Result<Vec<Json>> {
    let raw = if source == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf).context("reading event from stdin")?;
        buf
    } else {
        std::fs::read_to_string(source).with_context(|| format!("reading event file {}", source))?
    };
    let parsed: Json = serde_json::from_str(&raw).context("parsing event JSON")?;
    Ok(match parsed {
        Json::Array(events) => events,
        single => vec![single],
    })
}

fn lookup(repo: &dyn GraphRepository, ns: &str, kind: ResourceKind, uid: &str) -> Result<Resource> {
    repo.get(ns, kind, uid)?.ok_or_else(|| anyhow!("no {} {:?} in namespace {}", kind, uid, ns))
}

fn print_report(output: Output, report: &CycleReport) -> Result<()> {
    match output {
        Output::Human => {
            for (kind, count) in &report.counts {
                println!("{:<18} {}", kind, count);
            }
            println!(
                "epoch {} • {} skipped • {} relations ({} dangling)",
                report.epoch, report.skipped, report.relations.upserted, report.relations.dangling
            );
            for (service, status) in &report.rolled_up {
                println!("  {} -> {}", service, status);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(report)?),
    }
    Ok(())
}

async fn run_sync(cli: &Cli, kinds: &[String], interval: Option<u64>, ephemeral: bool) -> Result<()> {
    let kinds = if kinds.is_empty() {
        DEFAULT_KINDS.to_vec()
    } else {
        kinds.iter().map(|k| parse_kind(k)).collect::<Result<Vec<_>>>()?
    };
    let config = SyncConfig::from_env()?.with_namespace(&cli.namespace);
    let repo = open_repo(cli.db.as_deref(), ephemeral)?;
    let transport = Arc::new(SaltApiClient::new()?);
    let reconciler = Reconciler::new(transport, repo, config);
    info!(kinds = ?kinds, ns = %cli.namespace, interval = ?interval, "sync invoked");

    loop {
        match reconciler.sync(&kinds).await {
            Ok(report) => print_report(cli.output, &report)?,
            Err(e) if interval.is_some() => error!(error = %e, "cycle failed"),
            Err(e) => return Err(e.into()),
        }
        let Some(secs) = interval else { break };
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
            _ = signal::ctrl_c() => {
                info!("Ctrl-C received; stopping sync loop");
                break;
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let ns = cli.namespace.as_str();

    match &cli.command {
        Commands::Sync { kinds, interval, ephemeral } => run_sync(&cli, kinds, *interval, *ephemeral).await?,
        Commands::Ls { kind } => {
            let kind = parse_kind(kind)?;
            let repo = open_repo(cli.db.as_deref(), false)?;
            let items = repo.list_kind(ns, kind)?;
            match cli.output {
                Output::Human => {
                    println!("{:<32} {:<32} STATUS", "UID", "LABEL");
                    for r in items.values() {
                        println!("{:<32} {:<32} {}", r.uid, r.label, r.status);
                    }
                }
                Output::Json => {
                    let rows: Vec<&Resource> = items.values().collect();
                    println!("{}", serde_json::to_string_pretty(&rows)?);
                }
            }
        }
        Commands::Show { kind, uid } => {
            let kind = parse_kind(kind)?;
            let repo = open_repo(cli.db.as_deref(), false)?;
            let resource = lookup(repo.as_ref(), ns, kind, uid)?;
            let mut outgoing = Vec::new();
            let mut incoming = Vec::new();
            for rel in RelationKind::ALL {
                if rel.source_kind() == kind {
                    outgoing.extend(repo.relations_from(ns, uid, rel)?);
                }
                if rel.target_kind() == kind {
                    incoming.extend(repo.relations_to(ns, uid, rel)?);
                }
            }
            match cli.output {
                Output::Human => {
                    println!("{} {} ({}) • {}", resource.kind, resource.uid, resource.label, resource.status);
                    println!("{}", serde_json::to_string_pretty(&resource.metadata)?);
                    for r in &outgoing {
                        println!("-> {} {}", r.kind, r.target_uid);
                    }
                    for r in &incoming {
                        println!("<- {} {}", r.kind, r.source_uid);
                    }
                }
                Output::Json => {
                    let out = serde_json::json!({"resource": resource, "outgoing": outgoing, "incoming": incoming});
                    println!("{}", serde_json::to_string_pretty(&out)?);
                }
            }
        }
        Commands::Event { source } => {
            let repo = open_repo(cli.db.as_deref(), false)?;
            let mut reports = Vec::new();
            for event in read_events(source)? {
                reports.push(rollup::record_apply_event(repo.as_ref(), ns, &event)?);
            }
            repo.publish()?;
            match cli.output {
                Output::Human => {
                    for report in &reports {
                        println!("recorded {} • duplicates {} • skipped {}", report.recorded, report.duplicates, report.skipped);
                        for (service, status) in &report.services {
                            println!("  {} -> {}", service, status);
                        }
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&reports)?),
            }
        }
        Commands::Fields { kind, uid, action } => {
            let kind = parse_kind(kind)?;
            let action: Action = action.parse()?;
            let repo = open_repo(cli.db.as_deref(), false)?;
            let resource = lookup(repo.as_ref(), ns, kind, uid)?;
            let schema = brine_ops::describe(&resource, action);
            match cli.output {
                Output::Human => {
                    if schema.is_empty() {
                        println!("{} takes no input on {} (not supported)", action, kind);
                    }
                    for f in &schema {
                        let req = if f.required { "required" } else { "optional" };
                        println!("{:<12} {:<20} {:?} {} {}", f.name, f.label, f.kind, req, f.initial.unwrap_or(""));
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&schema.as_slice())?),
            }
        }
        Commands::Run { kind, uid, action, set } => {
            let kind = parse_kind(kind)?;
            let action: Action = action.parse()?;
            let inputs = parse_set(set)?;
            let repo = open_repo(cli.db.as_deref(), false)?;
            let resource = lookup(repo.as_ref(), ns, kind, uid)?;
            let config = SyncConfig::from_env()?;
            let ops = SaltOps::new(Arc::new(SaltApiClient::new()?), config.credentials).with_timeout(config.query_timeout_secs);
            info!(kind = %kind, uid = %uid, action = %action, "run invoked");
            match ops.execute(&resource, action, &inputs).await? {
                Some(result) => println!("{}", serde_json::to_string_pretty(&result)?),
                None => {
                    warn!(action = %action, uid = %uid, "action returned nothing");
                    eprintln!("{} on {} {}: nothing returned (unsupported or login refused)", action, kind, uid);
                }
            }
        }
    }

    Ok(())
}
