mod feed;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use vigil_core::{
    AlertSink, EscalationScanner, FanoutSink, JsonlSink, MemoryStore, SnapshotManager,
    TracingSink, VigilConfig, ViolationEngine, ViolationStore,
};

use feed::ObservationFeed;

/// Expand ~ to the user's home directory
fn expand_tilde(path: &str) -> String {
    if path.starts_with("~/") {
        if let Some(home) = std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE")) {
            return format!("{}/{}", home.to_string_lossy(), &path[2..]);
        }
    }
    path.to_string()
}

#[derive(Parser, Debug)]
#[command(name = "vigil", version, about = "Vigil — SLO violation detection and escalation")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "vigil.toml")]
    config: String,

    /// Log level (overrides config file)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Generate a default config file and exit
    #[arg(long)]
    generate_config: bool,

    /// Dry-run: load config, print resolved escalation policies, exit
    #[arg(long)]
    dry_run: bool,

    /// Observation feed: JSONL file path, or "-" for stdin
    #[arg(short, long)]
    feed: Option<String>,

    /// Components file (JSON array) registered into the store at boot;
    /// observations for components marked inactive are dropped
    #[arg(long)]
    components: Option<String>,

    /// Snapshot directory (overrides config file)
    #[arg(long)]
    snapshot_dir: Option<String>,

    /// Alert log file path (overrides config file)
    #[arg(long)]
    alert_log: Option<String>,

    /// Exit after draining the feed instead of running the scan loop
    #[arg(long)]
    oneshot: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Generate Config ──────────────────────────────────────────────
    if cli.generate_config {
        let config = VigilConfig::default();
        config.save(&cli.config).map_err(|e| anyhow::anyhow!(e))?;
        println!("Default configuration written to {}", cli.config);
        return Ok(());
    }

    // ── Load Config ──────────────────────────────────────────────────
    let config = VigilConfig::load(&cli.config).unwrap_or_else(|e| {
        eprintln!("Warning: {}, using defaults", e);
        VigilConfig::default()
    });

    let log_level = cli.log_level.as_deref().unwrap_or(&config.general.log_level);

    // ── Tracing ──────────────────────────────────────────────────────
    let level = match log_level {
        "trace" => Level::TRACE, "debug" => Level::DEBUG,
        "warn" => Level::WARN, "error" => Level::ERROR, _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Vigil v{}", env!("CARGO_PKG_VERSION"));

    // ── Dry Run ──────────────────────────────────────────────────────
    if cli.dry_run {
        let default_policy = config.default_policy();
        info!(
            extended_count_threshold = default_policy.extended_count_threshold,
            additional_downtime_threshold_secs = default_policy.additional_downtime_threshold_secs,
            short_window_secs = default_policy.short_window_secs,
            long_window_secs = default_policy.long_window_secs,
            "Default escalation policy"
        );
        for (protocol, policy) in config.protocol_policies() {
            info!(
                protocol = %protocol,
                extended_count_threshold = policy.extended_count_threshold,
                additional_downtime_threshold_secs = policy.additional_downtime_threshold_secs,
                "Protocol policy override"
            );
        }
        info!("Dry-run complete. Configuration valid.");
        return Ok(());
    }

    // ── Store + Snapshots ────────────────────────────────────────────
    let store = Arc::new(MemoryStore::new());
    let snapshot_dir = expand_tilde(
        cli.snapshot_dir.as_deref().unwrap_or(&config.general.snapshot_dir),
    );
    let snapshots = Arc::new(SnapshotManager::new(&snapshot_dir));
    if let Err(e) = snapshots.init() {
        warn!(error = %e, "Snapshot init failed (snapshots disabled)");
    } else {
        match snapshots.load(store.as_ref()) {
            Ok(true) => info!(dir = %snapshot_dir, "Violation store restored from snapshot"),
            Ok(false) => info!(dir = %snapshot_dir, "No snapshot found, starting empty"),
            Err(e) => warn!(error = %e, "Snapshot restore failed, starting empty"),
        }
    }

    let findings = store.integrity_check()?;
    for finding in &findings {
        warn!(finding = %finding, "Integrity check finding");
    }
    if findings.is_empty() {
        info!("Integrity check passed");
    }

    // ── Component Registry ───────────────────────────────────────────
    if let Some(path) = &cli.components {
        let data = std::fs::read_to_string(path)?;
        let components: Vec<vigil_core::Component> = serde_json::from_str(&data)?;
        let count = components.len();
        for component in components {
            store.register_component(component)?;
        }
        info!(count, file = %path, "Components registered");
    }

    // ── Alert Sinks ──────────────────────────────────────────────────
    let alert_log = expand_tilde(
        cli.alert_log.as_deref().unwrap_or(&config.general.alert_log),
    );
    let sink: Arc<dyn AlertSink> = Arc::new(FanoutSink::new(vec![
        Box::new(TracingSink),
        Box::new(JsonlSink::new(&alert_log)),
    ]));
    info!(log = %alert_log, "Alert sinks ready");

    // ── Engine + Scanner ─────────────────────────────────────────────
    let engine = Arc::new(
        ViolationEngine::new(store.clone() as Arc<dyn ViolationStore>).with_sink(sink.clone()),
    );

    let mut scanner = EscalationScanner::new(store.clone() as Arc<dyn ViolationStore>)
        .with_default_policy(config.default_policy())
        .with_sink(sink.clone());
    for (protocol, policy) in config.protocol_policies() {
        scanner = scanner.with_protocol_policy(protocol, policy);
    }
    let scanner = Arc::new(scanner);

    // ── Feed ─────────────────────────────────────────────────────────
    let observation_feed = Arc::new(
        ObservationFeed::new(engine.clone())
            .with_registry(store.clone() as Arc<dyn ViolationStore>),
    );
    if let Some(feed_path) = &cli.feed {
        if feed_path == "-" {
            let stdin_feed = observation_feed.clone();
            let summary = tokio::task::spawn_blocking(move || {
                let stdin = std::io::stdin();
                stdin_feed.ingest_reader(stdin.lock())
            })
            .await??;
            info!(
                ingested = summary.ingested,
                transitions = summary.transitions,
                rejected = summary.rejected,
                parse_errors = summary.parse_errors,
                "Stdin feed drained"
            );
        } else {
            let file = std::fs::File::open(feed_path)?;
            let summary = observation_feed.ingest_reader(std::io::BufReader::new(file))?;
            info!(
                feed = %feed_path,
                ingested = summary.ingested,
                transitions = summary.transitions,
                rejected = summary.rejected,
                parse_errors = summary.parse_errors,
                "Feed drained"
            );
        }
    }

    if cli.oneshot {
        let now = chrono::Utc::now().timestamp();
        let short = scanner.short_window_scan(now)?;
        let long = scanner.long_window_scan(now)?;
        info!(
            extended_opened = short.opened, extended_closed = short.closed,
            additional_opened = long.opened,
            "Oneshot scan complete"
        );
        if let Err(e) = snapshots.save(store.as_ref()) {
            warn!(error = %e, "Final snapshot failed");
        }
        return Ok(());
    }

    // ── Scan Loops ───────────────────────────────────────────────────
    let short_scanner = scanner.clone();
    let short_interval = config.escalation.short_scan_interval_secs;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(short_interval));
        loop {
            ticker.tick().await;
            let now = chrono::Utc::now().timestamp();
            match short_scanner.short_window_scan(now) {
                Ok(report) => {
                    if report.opened + report.closed > 0 {
                        info!(opened = report.opened, closed = report.closed,
                            pairs = report.pairs_scanned, "Short-window scan");
                    }
                }
                Err(e) => warn!(error = %e, "Short-window scan failed"),
            }
        }
    });

    let long_scanner = scanner.clone();
    let long_interval = config.escalation.long_scan_interval_secs;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(long_interval));
        loop {
            ticker.tick().await;
            let now = chrono::Utc::now().timestamp();
            match long_scanner.long_window_scan(now) {
                Ok(report) => {
                    if report.opened > 0 {
                        info!(opened = report.opened, pairs = report.pairs_scanned,
                            "Long-window scan");
                    }
                }
                Err(e) => warn!(error = %e, "Long-window scan failed"),
            }
        }
    });

    // ── Periodic Snapshots ───────────────────────────────────────────
    if config.general.snapshot_interval_secs > 0 {
        let snap_store = store.clone();
        let snap_manager = snapshots.clone();
        let interval = config.general.snapshot_interval_secs;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval));
            loop {
                ticker.tick().await;
                if let Err(e) = snap_manager.save(snap_store.as_ref()) {
                    warn!(error = %e, "Snapshot failed");
                }
            }
        });
    }

    info!("Vigil running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down Vigil...");

    // ── Graceful Shutdown ────────────────────────────────────────────
    match snapshots.save(store.as_ref()) {
        Ok(meta) => info!(bytes = meta.size_bytes, "Final snapshot saved"),
        Err(e) => warn!(error = %e, "Final snapshot failed"),
    }

    info!(
        observations = engine.ingested(),
        rejected = engine.rejected(),
        conflicts_retried = engine.conflicts_retried(),
        scans = scanner.scans_completed(),
        escalations_opened = scanner.events_opened(),
        escalations_closed = scanner.events_closed(),
        "Shutdown complete"
    );

    Ok(())
}
