//! `fleetlink-cli` – operator console for the fleet bridge.
//!
//! This binary wires the whole bridge together and hands it to an operator.
//! It:
//!
//! 1. Checks for `~/.fleetlink/config.toml`; runs a **First-Run Wizard** when
//!    the file is absent.
//! 2. Opens the order record store, loads the template catalog and connects
//!    the MQTT, HTTP and WebSocket transports.
//! 3. Starts the telemetry ingestor, the status cache sweeper and the
//!    pending-command expiry task.
//! 4. Drops the user into an **interactive REPL** that dispatches orders and
//!    direct commands (`/help` lists them).
//! 5. Intercepts **Ctrl-C** to fail every outstanding command, close the
//!    transports and exit.

mod config;
mod repl;

use colored::Colorize;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use fleetlink_kernel::{RateLimiter, StatusCache};
use fleetlink_middleware::{
    EventBus, HttpTransport, MqttTransport, StreamTransport, Topic, TransportRegistry,
};
use fleetlink_runtime::{
    ExecutionEngine, InMemoryTemplateRepository, PresenceTracker, TelemetryIngestor,
    TemplateRepository,
};
use fleetlink_store::OrderRecordStore;
use fleetlink_types::{EventPayload, TransportKind};

/// Reason attached to commands still pending when the bridge stops.
const SHUTDOWN_REASON: &str = "bridge shutting down";

/// How long startup waits for the broker before continuing offline.
const BROKER_CONNECT_WAIT: Duration = Duration::from_secs(3);

fn main() {
    // Keep the guard alive for the whole process so spans are flushed.
    let _otel = fleetlink_runtime::init_tracing("fleetlink");

    print_banner();

    let cfg = config::with_env_overrides(match config::load() {
        Ok(None) => run_first_run_wizard(),
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            config::Config::default()
        }
    });

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}: {}", "Failed to start async runtime".red(), e);
            std::process::exit(1);
        }
    };

    let bridge = match runtime.block_on(Bridge::start(&cfg, &config::config_path())) {
        Ok(bridge) => Arc::new(bridge),
        Err(e) => {
            eprintln!("{}: {}", "Bridge failed to start".red(), e);
            std::process::exit(1);
        }
    };

    // ── Shared shutdown flag ──────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let handle = runtime.handle().clone();
    let bridge_ctrlc = Arc::clone(&bridge);
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – initiating graceful shutdown …".yellow().bold());
        shutdown_clone.store(true, Ordering::SeqCst);
        let failed = handle.block_on(bridge_ctrlc.shutdown(SHUTDOWN_REASON));
        println!("{}", format!("  ✓ {failed} pending command(s) failed.").green());
        println!("{}", "  ✓ Transports closed. Exiting fleetlink.".green());
        std::process::exit(0);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    println!();
    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());

    // ── Interactive REPL ──────────────────────────────────────────────────
    repl::run(&bridge, runtime.handle(), shutdown);

    let failed = runtime.block_on(bridge.shutdown(SHUTDOWN_REASON));
    info!(failed, "bridge stopped");
}

// ─────────────────────────────────────────────────────────────────────────────
// Wiring
// ─────────────────────────────────────────────────────────────────────────────

/// Everything the REPL and the shutdown path need once the bridge is up.
pub struct Bridge {
    pub engine: Arc<ExecutionEngine>,
    pub presence: Arc<PresenceTracker>,
    pub templates: Arc<InMemoryTemplateRepository>,
    mqtt: Arc<MqttTransport>,
    tasks: Vec<JoinHandle<()>>,
}

impl Bridge {
    async fn start(cfg: &config::Config, config_file: &Path) -> Result<Self, String> {
        let bus = EventBus::default();
        let resolver = cfg.resolver();

        // ── Store ─────────────────────────────────────────────────────────
        let db_path = cfg.database_path_or(config_file);
        if let Some(dir) = db_path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)
                .map_err(|e| format!("Failed to create {}: {}", dir.display(), e))?;
        }
        let store = OrderRecordStore::open(&db_path)
            .map_err(|e| format!("Failed to open {}: {}", db_path.display(), e))?;
        println!("  Order records at {}", db_path.display().to_string().bold());
        let recovered = store
            .recover_in_flight()
            .await
            .map_err(|e| format!("Failed to recover {}: {}", db_path.display(), e))?;
        if !recovered.is_empty() {
            println!(
                "  {} interrupted dispatch(es) marked {}",
                recovered.len(),
                "FAILED".red()
            );
        }

        // ── Templates ─────────────────────────────────────────────────────
        let templates = match &cfg.templates_path {
            Some(path) => Arc::new(InMemoryTemplateRepository::load_json(path).map_err(|e| e.to_string())?),
            None => {
                warn!("no templates_path configured; templated orders are unavailable");
                Arc::new(InMemoryTemplateRepository::new())
            }
        };
        println!("  {} order template(s) loaded", templates.template_ids().len());

        // ── Transports ────────────────────────────────────────────────────
        let registry = Arc::new(TransportRegistry::new(cfg.default_transport));

        let mqtt = Arc::new(
            MqttTransport::new(cfg.mqtt_config(), resolver.clone()).with_bus(Arc::new(bus.clone())),
        );
        mqtt.connect();
        registry.register(TransportKind::Queue, mqtt.clone());

        let http = HttpTransport::new(Duration::from_millis(cfg.http.timeout_ms))
            .map_err(|e| e.to_string())?;
        registry.register(TransportKind::Http, Arc::new(http));
        registry.register(
            TransportKind::Stream,
            Arc::new(StreamTransport::new(Duration::from_millis(cfg.stream.timeout_ms))),
        );

        print!("  Connecting to broker at {}:{} … ", cfg.mqtt.host, cfg.mqtt.port);
        if mqtt.wait_connected(BROKER_CONNECT_WAIT).await {
            println!("{}", "online".green());
        } else {
            println!("{}", "offline (retrying in background)".yellow());
        }

        // ── Core ──────────────────────────────────────────────────────────
        let presence = Arc::new(PresenceTracker::new(&cfg.fallback_manufacturer));
        let engine = Arc::new(
            ExecutionEngine::new(
                templates.clone() as Arc<dyn TemplateRepository>,
                presence.clone(),
                registry,
                store,
            )
            .with_resolver(resolver)
            .with_bus(bus.clone()),
        );

        let status_cache = Arc::new(StatusCache::with_config(
            cfg.status_cache.heartbeat(),
            cfg.status_cache.ttl(),
        ));
        let limiter = Arc::new(RateLimiter::new(
            Duration::from_millis(cfg.rate_limit.min_interval_ms),
            Duration::from_millis(cfg.rate_limit.burst_interval_ms),
        ));
        let ingestor = Arc::new(
            TelemetryIngestor::new(engine.clone(), presence.clone(), status_cache.clone(), bus.clone())
                .with_rate_limiter(limiter),
        );

        let tasks = vec![
            ingestor.spawn(),
            status_cache.spawn_sweeper(cfg.status_cache.sweep_interval()),
            spawn_pending_expiry(engine.clone(), cfg.pending_ttl()),
            spawn_result_printer(&bus),
        ];

        info!(default_transport = %cfg.default_transport, "bridge started");
        Ok(Self {
            engine,
            presence,
            templates,
            mqtt,
            tasks,
        })
    }

    pub fn broker_connected(&self) -> bool {
        self.mqtt.is_connected()
    }

    /// Fail every pending command, stop background tasks and close every
    /// transport.  Returns the number of commands failed.
    async fn shutdown(&self, reason: &str) -> usize {
        let failed = self.engine.fail_all_pending(reason).await.len();
        for task in &self.tasks {
            task.abort();
        }
        if let Err(e) = self.engine.registry().close_all().await {
            warn!(error = %e, "transports did not close cleanly");
        }
        failed
    }
}

/// Fail direct commands that outlive `ttl`, checking every `ttl / 10`.
fn spawn_pending_expiry(engine: Arc<ExecutionEngine>, ttl: Duration) -> JoinHandle<()> {
    let period = (ttl / 10).max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let expired = engine.expire_pending(ttl).await;
            if !expired.is_empty() {
                warn!(expired = expired.len(), "pending commands expired");
            }
        }
    })
}

/// Print each command result as it settles.
fn spawn_result_printer(bus: &EventBus) -> JoinHandle<()> {
    let mut results = bus.subscribe_to(Topic::CommandResults);
    tokio::spawn(async move {
        while let Ok(event) = results.recv().await {
            if let EventPayload::CommandResult(result) = event.payload {
                println!(
                    "\n  {} {} on {} ({}): {:?}{}",
                    "◆".cyan(),
                    result.correlation_key.bold(),
                    result.device_id,
                    result.command_text.dimmed(),
                    result.verdict,
                    result.message.map(|m| format!(" – {m}")).unwrap_or_default()
                );
            }
        }
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// First-Run Wizard
// ─────────────────────────────────────────────────────────────────────────────

fn run_first_run_wizard() -> config::Config {
    println!();
    println!("{}", "  ╔══════════════════════════════════════╗".bold().cyan());
    println!("{}", "  ║      fleetlink First-Run Wizard      ║".bold().cyan());
    println!("{}", "  ╚══════════════════════════════════════╝".bold().cyan());
    println!();
    println!("  No configuration found.  Let's set up the bridge.\n");

    let mut cfg = config::Config::default();

    cfg.mqtt.host = prompt_line(&format!("  MQTT broker host [{}]: ", cfg.mqtt.host), &cfg.mqtt.host);

    let port_str = prompt_line(
        &format!("  MQTT broker port [{}]: ", cfg.mqtt.port),
        &cfg.mqtt.port.to_string(),
    );
    if let Ok(p) = port_str.trim().parse::<u16>() {
        cfg.mqtt.port = p;
    }

    println!("  Default transport for commands?  (queue / http / stream)");
    let kind = prompt_line(
        &format!("  Default transport [{}]: ", cfg.default_transport),
        cfg.default_transport.as_str(),
    );
    match kind.parse::<TransportKind>() {
        Ok(kind) => cfg.default_transport = kind,
        Err(e) => println!("  {} – keeping {}", e.to_string().yellow(), cfg.default_transport),
    }

    let templates = prompt_line("  Template catalog (JSON) path [none]: ", "");
    if !templates.is_empty() {
        cfg.templates_path = Some(templates.into());
    }

    match config::save(&cfg) {
        Ok(()) => println!(
            "\n  {} Config saved to {}\n",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
    cfg
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   ______         __  ___      __  "#.bold().cyan());
    println!("{}", r#"  / __/ /__ ___ _/ /_/ (_)__  / /__"#.bold().cyan());
    println!("{}", r#" / _// / -_) -_) __/ / / _ \/  '_/"#.bold().cyan());
    println!("{}", r#"/_/ /_/\__/\__/\__/_/_/_//_/_/\_\ "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "fleetlink".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Fleet order dispatch bridge");
    println!();
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn prompt_line(msg: &str, default: &str) -> String {
    use std::io::{BufRead, Write};
    print!("{}", msg);
    std::io::stdout().flush().ok();
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(_) => {
            let t = line.trim().to_string();
            if t.is_empty() { default.to_string() } else { t }
        }
        Err(_) => default.to_string(),
    }
}
