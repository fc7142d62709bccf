use crate::{
    config::Config,
    connectivity::{ConnectivitySignal, probe_once, spawn_probe},
    orchestrator::{Orchestrator, SubmissionResult},
    queue::{JsonFileStore, LocalQueue},
    remote::{HttpRemoteStore, Outcome, RemoteId, RemoteStore, ReportPatch},
    replayer::{DeliveryLog, ReplayEvent, Replayer, Trigger, TriggerOutcome},
    report::{self, Agency, PhotoRef, RawInputs, ReportStatus},
    util::{ensure_dir, hash_file, looks_like_url},
};
use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "complaint-relay")]
#[command(about = "Offline-first incident report submission (durable queue + connectivity-triggered replay)")]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// Path to config TOML. If omitted, uses ./complaint-relay.toml if present.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override log level (trace/debug/info/warn/error).
    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print effective config, queue state and store reachability.
    Doctor {},
    /// List agency codes accepted by --agency.
    Agencies {},
    /// Show reports waiting for delivery.
    Status {},
    /// Build a report and submit it (sent now, or queued when offline).
    Submit {
        #[arg(long)]
        title: String,
        #[arg(long)]
        description: String,
        /// Path or URI of the already-processed photo.
        #[arg(long)]
        photo: Option<String>,
        /// Agency code, e.g. dept_pcb.
        #[arg(long)]
        agency: Option<String>,
        #[arg(long, allow_hyphen_values = true)]
        lat: Option<f64>,
        #[arg(long, allow_hyphen_values = true)]
        lon: Option<f64>,
        #[arg(long)]
        address: Option<String>,
        /// Reverse-geocode component; repeatable, joined in order.
        #[arg(long = "address-part")]
        address_parts: Vec<String>,
        #[arg(long)]
        author: Option<String>,
        /// Capture time (RFC 3339); defaults to now.
        #[arg(long)]
        captured_at: Option<String>,
    },
    /// Run one drain of the queue now.
    Drain {},
    /// Watch connectivity and replay queued reports until Ctrl-C.
    Watch {},
    /// Patch the status of a delivered report.
    SetStatus {
        #[arg(long)]
        id: String,
        #[arg(long)]
        status: String,
        /// Current status, checked for a forward transition when given.
        #[arg(long)]
        from: Option<String>,
    },
}

pub async fn dispatch(args: Args) -> Result<()> {
    let cfg = match resolve_config_path(args.config.as_deref()) {
        Some(path) => Config::load(&path)?,
        None => Config::default(),
    };
    let log_path = resolve_log_path(&cfg);
    let _guard = init_logging(&args, &cfg, log_path.as_deref())?;

    match args.cmd {
        Command::Doctor {} => doctor(&cfg).await,
        Command::Agencies {} => agencies(),
        Command::Status {} => status(&cfg),
        Command::Submit {
            title,
            description,
            photo,
            agency,
            lat,
            lon,
            address,
            address_parts,
            author,
            captured_at,
        } => {
            let raw = RawInputs {
                title,
                description,
                photo: photo.as_deref().map(photo_ref).transpose()?,
                agency,
                latitude: lat,
                longitude: lon,
                address,
                address_parts,
                captured_at,
                author,
            };
            submit(&cfg, raw).await
        }
        Command::Drain {} => drain(&cfg).await,
        Command::Watch {} => watch(&cfg).await,
        Command::SetStatus { id, status, from } => set_status(&cfg, &id, &status, from.as_deref()).await,
    }
}

fn resolve_config_path(user: Option<&Path>) -> Option<PathBuf> {
    if let Some(p) = user {
        return Some(p.to_path_buf());
    }
    ["complaint-relay.toml", "complaint-relay.example.toml"]
        .into_iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
}

fn init_logging(args: &Args, cfg: &Config, file_path: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let level = args
        .log_level
        .as_deref()
        .unwrap_or(cfg.logging.level.as_str());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // stdout carries command output; logs go to stderr
    let stderr_layer = if cfg.logging.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed()
    };

    let (file_layer, guard) = if let Some(path) = file_path {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        ensure_dir(parent)?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open log file: {}", path.display()))?;
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .boxed();
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow!("failed to init logging: {e}"))?;

    Ok(guard)
}

fn resolve_log_path(cfg: &Config) -> Option<PathBuf> {
    if !cfg.logging.write_to_file {
        return None;
    }
    if !cfg.logging.file_path.is_empty() {
        return Some(PathBuf::from(&cfg.logging.file_path));
    }
    let queue_dir = Path::new(&cfg.queue.path)
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    Some(queue_dir.join("complaint-relay.log"))
}

fn photo_ref(input: &str) -> Result<PhotoRef> {
    let path = Path::new(input);
    if looks_like_url(input) || !path.is_file() {
        return Ok(PhotoRef {
            uri: input.to_string(),
            sha256: None,
        });
    }
    let sha256 = hash_file(path).with_context(|| format!("hashing photo: {}", path.display()))?;
    let canonical = path
        .canonicalize()
        .with_context(|| format!("canonicalize photo: {}", path.display()))?;
    Ok(PhotoRef {
        uri: format!("file://{}", canonical.display()),
        sha256: Some(sha256),
    })
}

fn open_queue(cfg: &Config) -> Result<Arc<LocalQueue>> {
    let store = JsonFileStore::new(&cfg.queue.path, cfg.queue.fsync);
    let queue = LocalQueue::open(Box::new(store))
        .with_context(|| format!("opening queue: {}", cfg.queue.path))?;
    Ok(Arc::new(queue))
}

fn open_remote(cfg: &Config) -> Result<Arc<dyn RemoteStore>> {
    Ok(Arc::new(HttpRemoteStore::new(cfg)?))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn doctor(cfg: &Config) -> Result<()> {
    let queue = open_queue(cfg)?;
    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(cfg.connectivity.probe_timeout_ms.max(1)))
        .build()?;
    let probe_url = if cfg.connectivity.probe_url.is_empty() {
        cfg.remote.base_url.as_str()
    } else {
        cfg.connectivity.probe_url.as_str()
    };
    let reachable = probe_once(&client, probe_url).await;
    print_json(&serde_json::json!({
        "config": cfg,
        "queue": {
            "path": cfg.queue.path,
            "pending": queue.len()?,
        },
        "store": {
            "probe_url": probe_url,
            "reachable": reachable,
        },
    }))
}

fn agencies() -> Result<()> {
    let list: Vec<_> = Agency::ALL
        .iter()
        .map(|a| serde_json::json!({ "code": a.code(), "name": a.display_name() }))
        .collect();
    print_json(&list)
}

fn status(cfg: &Config) -> Result<()> {
    let queue = open_queue(cfg)?;
    let entries = queue.snapshot_all()?;
    let items: Vec<_> = entries
        .iter()
        .map(|e| {
            serde_json::json!({
                "seq": e.seq,
                "title": e.report.title(),
                "agency": e.report.agency(),
                "location": e.report.location_label(),
                "captured_at": e.report.created_at(),
                "enqueued_at": e.enqueued_at,
                "attempts": e.attempt_count,
            })
        })
        .collect();
    print_json(&serde_json::json!({
        "summary": format!("{} complaints pending sync", entries.len()),
        "pending": items,
    }))
}

async fn submit(cfg: &Config, raw: RawInputs) -> Result<()> {
    let report = match report::build(cfg, raw) {
        Ok(r) => r,
        Err(e) => {
            print_json(&serde_json::json!({ "result": "invalid", "errors": e.messages() }))?;
            bail!("report is incomplete");
        }
    };

    let queue = open_queue(cfg)?;
    let remote = open_remote(cfg)?;
    let orchestrator = Orchestrator::new(remote, queue, DeliveryLog::new());
    let result = orchestrator.submit(report).await?;
    print_json(&result)?;

    match result {
        SubmissionResult::PermanentlyFailed { reason } => bail!("report rejected: {reason}"),
        SubmissionResult::QueuedForLaterDelivery { pending, .. } => {
            info!("offline; report saved locally ({pending} pending)");
            Ok(())
        }
        SubmissionResult::SentImmediately { .. } => Ok(()),
    }
}

async fn drain(cfg: &Config) -> Result<()> {
    let replayer = Replayer::new(open_queue(cfg)?, open_remote(cfg)?, DeliveryLog::new());
    match replayer.trigger(Trigger::Manual).await {
        TriggerOutcome::Completed(reports) => print_json(&reports),
        TriggerOutcome::Coalesced => Ok(()),
    }
}

async fn watch(cfg: &Config) -> Result<()> {
    let replayer = Arc::new(Replayer::new(
        open_queue(cfg)?,
        open_remote(cfg)?,
        DeliveryLog::new(),
    ));

    let mut replay_events = replayer.subscribe();
    let reporter = tokio::spawn(async move {
        loop {
            let event = match replay_events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("replay event reporter skipped {n} events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            match event {
                ReplayEvent::Delivered(rec) => {
                    if let Ok(line) = serde_json::to_string(&rec) {
                        println!("{line}");
                    }
                }
                ReplayEvent::Rejected(rej) => {
                    error!(seq = rej.seq, title = %rej.title, reason = %rej.reason, "report rejected and discarded");
                }
                ReplayEvent::Stopped(_) => {}
            }
        }
    });

    let signal = ConnectivitySignal::new(false);
    let events = signal.events();
    let probe = spawn_probe(cfg, signal)?;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("ctrl-c handler unavailable: {e}");
            std::future::pending::<()>().await;
        }
    };
    replayer
        .clone()
        .run(events, cfg.connectivity.drain_on_start, shutdown)
        .await;

    probe.abort();
    reporter.abort();
    info!(
        pending = replayer.queue().len()?,
        delivered = replayer.history().len(),
        "watch stopped"
    );
    Ok(())
}

async fn set_status(cfg: &Config, id: &str, status: &str, from: Option<&str>) -> Result<()> {
    let next: ReportStatus = status.parse().map_err(|e: String| anyhow!(e))?;
    if let Some(from) = from {
        let current: ReportStatus = from.parse().map_err(|e: String| anyhow!(e))?;
        if !current.can_advance_to(next) {
            bail!(
                "status cannot move from {} to {}",
                current.as_str(),
                next.as_str()
            );
        }
    }

    let remote = open_remote(cfg)?;
    let id = RemoteId::from(id);
    match remote.patch(&id, &ReportPatch::status(next)).await {
        Outcome::Success(()) => print_json(&serde_json::json!({
            "id": id,
            "status": next,
            "result": "updated",
        })),
        Outcome::Rejected(reason) => bail!("status update rejected: {reason}"),
        Outcome::Unreachable(reason) => bail!("store unreachable: {reason}"),
    }
}
