#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use metrics::counter;
use resync_apply::{ApplyConfig, DiffSummary, DirStore};
use resync_core::Json;
use resync_store::{Collection, CollectionEvent, Pending, Record, RecordSummary, ResourceKey};
use serde_json::json;
use tokio::signal;
use tokio::task::LocalSet;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "resyncctl", version, about = "Inspect and edit a directory of YAML resources")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Poll interval for the directory, in milliseconds
    #[arg(long = "poll-ms", env = "RESYNC_POLL_MS", global = true)]
    poll_ms: Option<u64>,

    /// How long to wait for a write to be confirmed, in milliseconds
    #[arg(long = "timeout-ms", global = true, default_value_t = 10_000)]
    timeout_ms: u64,

    /// Log filter directives
    #[arg(long = "log", env = "RESYNC_LOG", global = true, default_value = "info")]
    log: String,

    /// Serve Prometheus metrics on this address
    #[arg(long = "metrics-addr", env = "RESYNC_METRICS_ADDR", global = true)]
    metrics_addr: Option<SocketAddr>,

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
    /// List every resource under a directory
    Ls { dir: PathBuf },
    /// Print changes under a directory until Ctrl-C
    Watch { dir: PathBuf },
    /// Create a resource
    Create {
        dir: PathBuf,
        #[arg(long)]
        kind: String,
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "default")]
        namespace: String,
        /// Field assignment, e.g. spec.port=8080 (value parsed as JSON, else string)
        #[arg(long = "set", value_name = "PATH=VALUE")]
        sets: Vec<Assignment>,
    },
    /// Change fields of an existing resource
    Edit {
        dir: PathBuf,
        /// Resource key, e.g. Host::web::default
        key: ResourceKey,
        #[arg(long = "set", value_name = "PATH=VALUE", required = true)]
        sets: Vec<Assignment>,
    },
    /// Delete a resource
    Delete { dir: PathBuf, key: ResourceKey },
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Ls { .. } => "ls",
            Commands::Watch { .. } => "watch",
            Commands::Create { .. } => "create",
            Commands::Edit { .. } => "edit",
            Commands::Delete { .. } => "delete",
        }
    }
}

/// `path.to.field=value`.
#[derive(Clone, Debug, PartialEq)]
struct Assignment {
    path: Vec<String>,
    value: Json,
}

impl FromStr for Assignment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, raw) = s.split_once('=').ok_or_else(|| format!("expected PATH=VALUE, got {s:?}"))?;
        let path: Vec<String> = path.split('.').map(str::to_owned).collect();
        if path.iter().any(String::is_empty) {
            return Err(format!("empty path segment in {s:?}"));
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Json::String(raw.to_owned()));
        Ok(Self { path, value })
    }
}

/// `RESYNC_LOG` directives; a filter that does not parse falls back to `info`.
fn init_tracing(directives: &str) {
    let filter = tracing_subscriber::EnvFilter::try_new(directives).unwrap_or_else(|e| {
        eprintln!("ignoring RESYNC_LOG={directives:?}: {e}");
        tracing_subscriber::EnvFilter::new("info")
    });
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).with_writer(std::io::stderr).init();
}

fn init_metrics(addr: Option<SocketAddr>) {
    let Some(addr) = addr else { return };
    match metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => info!(%addr, "serving Prometheus metrics"),
        Err(e) => warn!(%addr, error = %e, "metrics exporter not started"),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log);
    init_metrics(cli.metrics_addr);
    counter!("resyncctl_commands_total", 1, "command" => cli.command.name());
    LocalSet::new().run_until(run(cli)).await
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = ApplyConfig::from_env();
    if let Some(ms) = cli.poll_ms {
        config = config.with_poll_interval(Duration::from_millis(ms));
    }
    let wait = Duration::from_millis(cli.timeout_ms);
    match cli.command {
        Commands::Ls { dir } => {
            let (_store, collection) = open(&dir, config).await?;
            let rows: Vec<RecordSummary> = collection.records().iter().map(Record::summary).collect();
            match cli.output {
                Output::Human => {
                    println!("{:<48} {:<14} VERSION", "KEY", "STATE");
                    for row in rows {
                        println!("{:<48} {:<14} {}", row.key, row.state, row.version.as_deref().unwrap_or("-"));
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
            }
        }
        Commands::Watch { dir } => {
            let (_store, collection) = open(&dir, config).await?;
            for record in collection.records() {
                print_event(cli.output, "existing", &record);
                watch_record(cli.output, &record);
            }
            let output = cli.output;
            collection.add_listener(move |event| match event {
                CollectionEvent::Added(record) => {
                    print_event(output, "added", record);
                    watch_record(output, record);
                }
                CollectionEvent::Removed(record) => print_event(output, "removed", record),
                CollectionEvent::Reconciled { loaded, removed } => debug!(loaded, removed, "reconciled"),
            });
            collection.subscribe();
            signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            info!("Ctrl-C received; shutting down watch loop");
        }
        Commands::Create { dir, kind, name, namespace, sets } => {
            let (_store, collection) = open(&dir, config).await?;
            collection.subscribe();
            let record = collection.create(&kind);
            record.update_yaml(|y| {
                y.set_path(&["metadata", "name"], Json::String(name))?;
                y.set_path(&["metadata", "namespace"], Json::String(namespace))?;
                assign(y, &sets)
            })?;
            check(&record)?;
            let diff = DiffSummary::of_edit(&record.value(), &json!({}));
            let pending = record.save()?;
            confirm(cli.output, &record, diff, pending, wait).await?;
        }
        Commands::Edit { dir, key, sets } => {
            let (_store, collection) = open(&dir, config).await?;
            collection.subscribe();
            let record = find(&collection, &key)?;
            record.edit()?;
            record.update_yaml(|y| assign(y, &sets))?;
            if record.deltas().is_empty() {
                record.cancel()?;
                println!("{key}: no changes");
                return Ok(());
            }
            check(&record)?;
            let base = record.stored_yaml().map(|s| (*s).clone()).unwrap_or_else(|| json!({}));
            let diff = DiffSummary::of_edit(&record.value(), &base);
            let pending = record.save()?;
            confirm(cli.output, &record, diff, pending, wait).await?;
        }
        Commands::Delete { dir, key } => {
            let (_store, collection) = open(&dir, config).await?;
            collection.subscribe();
            let record = find(&collection, &key)?;
            record.delete()?;
            let pending = record.save()?;
            confirm(cli.output, &record, DiffSummary::default(), pending, wait).await?;
        }
    }
    Ok(())
}

/// A collection over `dir`, filled from one listing.
async fn open(dir: &Path, config: ApplyConfig) -> Result<(DirStore, Collection)> {
    let store = DirStore::new(dir, config);
    let docs = store.list().await.with_context(|| format!("listing {}", dir.display()))?;
    let collection = Collection::new(Rc::new(store.clone()));
    collection.reconcile(docs);
    info!(dir = %dir.display(), records = collection.len(), "directory loaded");
    Ok((store, collection))
}

fn find(collection: &Collection, key: &ResourceKey) -> Result<Record> {
    collection.get(key).ok_or_else(|| anyhow!("{key} not found"))
}

fn assign(yaml: &mut resync_store::Tracker, sets: &[Assignment]) -> Result<(), resync_store::CowError> {
    for set in sets {
        let path: Vec<&str> = set.path.iter().map(String::as_str).collect();
        yaml.set_path(&path, set.value.clone())?;
    }
    Ok(())
}

fn check(record: &Record) -> Result<()> {
    let errors = record.validate();
    if errors.is_empty() {
        return Ok(());
    }
    for (field, msg) in &errors {
        eprintln!("{field}: {msg}");
    }
    bail!("{} invalid field(s)", errors.len())
}

async fn confirm(output: Output, record: &Record, diff: DiffSummary, pending: Pending, wait: Duration) -> Result<()> {
    let key = record.key();
    match tokio::time::timeout(wait, pending).await {
        Ok(result) => result.with_context(|| format!("writing {key}"))?,
        Err(_) => bail!("timed out waiting for {key} to be confirmed"),
    }
    match output {
        Output::Human => println!("{key}: {} ({diff})", record.state()),
        Output::Json => println!(
            "{}",
            serde_json::to_string_pretty(&json!({"key": key, "state": record.state(), "diff": diff}))?
        ),
    }
    Ok(())
}

fn watch_record(output: Output, record: &Record) {
    record.add_listener(move |r| print_event(output, "changed", r));
}

fn print_event(output: Output, event: &str, record: &Record) {
    let summary = record.summary();
    match output {
        Output::Human => {
            let mark = match event {
                "added" => "+",
                "removed" => "-",
                "changed" => "~",
                _ => " ",
            };
            println!("{mark} {} {}", summary.key, summary.state);
        }
        Output::Json => println!("{}", json!({"event": event, "record": summary})),
    }
}
