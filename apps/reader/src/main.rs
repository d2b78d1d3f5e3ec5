//! # heitz-reader
//!
//! BACnet point reader for the plant-room gateway.
//!
//! ## Startup
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          heitz-reader run                               │
//! │                                                                         │
//! │  1. Resolve config     defaults ◄ reader.toml ◄ environment            │
//! │  2. Init tracing       RUST_LOG, else [logging] level                   │
//! │  3. Validate config    any error ──► exit before a task starts          │
//! │  4. Open database      ./data/sensor_data.db (WAL)                      │
//! │  5. Build source       BACnet/IP socket, or simulation                  │
//! │  6. ReaderService      poller, sync, heartbeat, update                  │
//! │  7. SIGINT / SIGTERM   ordered shutdown, final flush                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use heitz_agent::{
    build_source, AgentConfig, BacnetSource, HttpApiClient, ReaderService, RemoteApi,
};
use heitz_core::{active_priority, ObjectReference, PointDescriptor};
use heitz_db::{migrations, Database, DbConfig};

/// Filter used when neither RUST_LOG nor a usable log level is set.
const DEFAULT_FILTER: &str = "info,heitz=debug,sqlx=warn";

/// Pause between a write and its read-back.
const SETTLE_DELAY: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[command(name = "heitz-reader")]
#[command(about = "Polls BACnet sensor points and syncs readings to the backend", long_about = None)]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Poll, queue and sync until interrupted
    Run,
    /// Read one object once and print its value
    Read {
        /// Object reference, e.g. analogInput:1 or av:3
        object: ObjectReference,

        #[command(flatten)]
        target: TargetArgs,
    },
    /// Command an object's present value and read it back
    Write {
        /// Object reference, e.g. analogValue:3
        object: ObjectReference,

        /// Value to write (binary objects take 0 or 1)
        #[arg(allow_negative_numbers = true)]
        value: f64,

        /// Command priority, 1 (highest) to 16
        #[arg(short, long, default_value_t = 16, value_parser = clap::value_parser!(u8).range(1..=16))]
        priority: u8,

        #[command(flatten)]
        target: TargetArgs,
    },
    /// Release a command by writing null at its priority
    Release {
        /// Object reference, e.g. analogValue:3
        object: ObjectReference,

        /// Command priority to release, 1 (highest) to 16
        #[arg(short, long, default_value_t = 16, value_parser = clap::value_parser!(u8).range(1..=16))]
        priority: u8,

        #[command(flatten)]
        target: TargetArgs,
    },
    /// Show local queue statistics
    Stats,
    /// Validate configuration and print a summary
    CheckConfig,
}

impl Command {
    /// Whether the command talks to the backend, and so needs a usable
    /// API URL and token.
    fn needs_backend(&self) -> bool {
        matches!(self, Command::Run | Command::CheckConfig)
    }
}

/// Per-invocation override of the target device address.
#[derive(Args, Debug, Default, PartialEq)]
struct TargetArgs {
    /// Target device IP (overrides bacnet.target_address)
    #[arg(long)]
    device_ip: Option<String>,

    /// Target device UDP port (overrides bacnet.target_port)
    #[arg(long)]
    device_port: Option<u16>,
}

impl TargetArgs {
    fn apply(&self, config: &mut AgentConfig) {
        if let Some(ip) = &self.device_ip {
            config.bacnet.target_address = ip.clone();
        }
        if let Some(port) = self.device_port {
            config.bacnet.target_port = port;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = AgentConfig::resolve(cli.config.clone());
    init_tracing(config.as_ref().ok(), cli.json);

    let mut config = config.context("Failed to load configuration")?;
    let command = cli.command.unwrap_or(Command::Run);

    if let Command::Read { target, .. }
    | Command::Write { target, .. }
    | Command::Release { target, .. } = &command
    {
        target.apply(&mut config);
    }

    if command.needs_backend() {
        config.validate().context("Invalid configuration")?;
    } else {
        config.validate_local().context("Invalid configuration")?;
    }

    match command {
        Command::Run => run(config).await,
        Command::Read { object, .. } => read(config, object).await,
        Command::Write {
            object,
            value,
            priority,
            ..
        } => write(config, object, value, priority).await,
        Command::Release {
            object, priority, ..
        } => release(config, object, priority).await,
        Command::Stats => stats(config).await,
        Command::CheckConfig => check_config(&config),
    }
}

/// Initializes the tracing subscriber.
///
/// ## Filter Priority
/// 1. `RUST_LOG`
/// 2. `[logging]` from config (`LOG_LEVEL`, `DEBUG`)
/// 3. `info,heitz=debug,sqlx=warn`
fn init_tracing(config: Option<&AgentConfig>, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        config
            .map(|c| {
                if c.logging.debug {
                    "debug,sqlx=warn".to_string()
                } else {
                    format!("{},sqlx=warn", c.logging.level.trim().to_lowercase())
                }
            })
            .and_then(|directives| EnvFilter::try_new(directives).ok())
            .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
    });

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(config: AgentConfig) -> anyhow::Result<()> {
    let config = Arc::new(config);

    info!(
        device = %config.device_id(),
        simulate = config.polling.simulate,
        "Starting heitz-reader"
    );

    let db = Database::new(DbConfig::new(&config.storage.db_path))
        .await
        .with_context(|| format!("Failed to open {}", config.storage.db_path.display()))?;

    let api: Arc<dyn RemoteApi> =
        Arc::new(HttpApiClient::from_config(&config).context("Failed to create API client")?);
    let source = build_source(&config)
        .await
        .context("Failed to set up point source")?;

    ReaderService::new(config, db, api, source)
        .run(shutdown_signal())
        .await
        .context("Reader service failed")?;

    info!("Shutdown complete");
    Ok(())
}

async fn read(config: AgentConfig, object: ObjectReference) -> anyhow::Result<()> {
    let source = build_source(&config)
        .await
        .context("Failed to set up point source")?;
    source.connect().await?;

    let point = PointDescriptor::new(object.to_string(), object, "", "");
    let sample = source
        .read_point(&point)
        .await
        .with_context(|| format!("Failed to read {}", object))?;

    println!("{} = {}", object, sample.value);
    if let Some(priorities) = &sample.priority_array {
        match active_priority(priorities) {
            Some(level) => println!("active priority: {}", level),
            None => println!("active priority: relinquished"),
        }
        for (slot, value) in priorities.iter().enumerate() {
            if let Some(value) = value {
                println!("  [{:>2}] {}", slot + 1, value);
            }
        }
    }

    Ok(())
}

/// Writes `value` at `priority`, then reads the object back.
///
/// The read-back shows whether this priority is in control; a higher
/// priority (lower number) still commanding the object wins.
async fn write(
    config: AgentConfig,
    object: ObjectReference,
    value: f64,
    priority: u8,
) -> anyhow::Result<()> {
    let source = BacnetSource::bind(&config.bacnet)
        .await
        .context("Failed to bind BACnet socket")?;
    let client = source.client();

    match client.read_present_value(object).await {
        Ok(current) => println!("{} current value: {}", object, current),
        Err(e) => warn!(object = %object, error = %e, "Could not read current value"),
    }

    client
        .write_present_value(object, value, priority)
        .await
        .with_context(|| format!("Failed to write {} to {}", value, object))?;
    info!(object = %object, value, priority, "Write accepted");

    tokio::time::sleep(SETTLE_DELAY).await;
    let now = client
        .read_present_value(object)
        .await
        .with_context(|| format!("Failed to read back {}", object))?;

    // Reals travel as f32.
    if (now - value).abs() <= f64::from(f32::EPSILON) * value.abs().max(1.0) {
        println!("{} = {} (priority {})", object, now, priority);
    } else {
        println!(
            "{} = {}, not {}; a higher priority may be in control",
            object, now, value
        );
        print_active_priority(&source, object).await;
    }

    Ok(())
}

/// Relinquishes `priority` and shows what the object falls back to.
async fn release(
    config: AgentConfig,
    object: ObjectReference,
    priority: u8,
) -> anyhow::Result<()> {
    let source = BacnetSource::bind(&config.bacnet)
        .await
        .context("Failed to bind BACnet socket")?;
    let client = source.client();

    client
        .relinquish(object, priority)
        .await
        .with_context(|| format!("Failed to release priority {} on {}", priority, object))?;
    info!(object = %object, priority, "Priority released");

    tokio::time::sleep(SETTLE_DELAY).await;
    let now = client
        .read_present_value(object)
        .await
        .with_context(|| format!("Failed to read back {}", object))?;
    println!("{} = {}", object, now);
    print_active_priority(&source, object).await;

    Ok(())
}

async fn print_active_priority(source: &BacnetSource, object: ObjectReference) {
    if !object.object_type.is_commandable() {
        return;
    }
    match source.client().read_priority_array(object).await {
        Ok(slots) => match active_priority(&slots) {
            Some(level) => println!("active priority: {}", level),
            None => println!("active priority: relinquished"),
        },
        Err(e) => warn!(object = %object, error = %e, "Could not read priority array"),
    }
}

async fn stats(config: AgentConfig) -> anyhow::Result<()> {
    let db = Database::new(DbConfig::new(&config.storage.db_path))
        .await
        .with_context(|| format!("Failed to open {}", config.storage.db_path.display()))?;

    let stats = db.readings().stats().await?;
    let schema = migrations::migration_status(db.pool()).await?;

    println!("database:    {}", config.storage.db_path.display());
    println!("migrations:  {}/{}", schema.applied, schema.embedded);
    println!("readings:    {}", stats.total);
    println!("  unposted:  {}", stats.unposted);
    println!("  posted:    {}", stats.posted);
    if let Some(oldest) = stats.oldest_unposted {
        println!("oldest unposted: {}", oldest.to_rfc3339());
    }

    db.close().await;
    Ok(())
}

fn check_config(config: &AgentConfig) -> anyhow::Result<()> {
    let base_url = config.api.base_url()?;

    println!("device:   {} ({})", config.device.id, config.device.name);
    println!("backend:  {}", base_url);
    if config.polling.simulate {
        println!("source:   simulated");
    } else {
        println!(
            "source:   bacnet {} -> {} (device {})",
            config.bacnet.local_socket_addr()?,
            config.bacnet.target_socket_addr()?,
            config.bacnet.target_device_id
        );
    }
    println!(
        "timing:   read {}s, post {}s, heartbeat {}s, update {}s",
        config.polling.read_interval_secs,
        config.sync.post_interval_secs,
        config.heartbeat.interval_secs,
        config.update.check_interval_secs
    );
    println!("storage:  {}", config.storage.db_path.display());
    println!("points:");
    for point in &config.points {
        println!("  {:<20} {:<20} {}", point.name, point.object.to_string(), point.unit);
    }

    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, stopping tasks");
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use heitz_core::ObjectType;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_is_default() {
        let cli = Cli::try_parse_from(["heitz-reader"]).unwrap();
        assert_eq!(cli.command, None);
        assert!(!cli.json);
    }

    #[test]
    fn test_read_parses_object() {
        let cli = Cli::try_parse_from(["heitz-reader", "read", "av:3", "--config", "r.toml"]).unwrap();
        assert_eq!(
            cli.command,
            Some(Command::Read {
                object: ObjectReference::new(ObjectType::AnalogValue, 3).unwrap(),
                target: TargetArgs::default(),
            })
        );
        assert_eq!(cli.config, Some(PathBuf::from("r.toml")));
    }

    #[test]
    fn test_write_defaults_to_priority_16() {
        let cli = Cli::try_parse_from(["heitz-reader", "write", "av:3", "-2.5"]).unwrap();
        assert_eq!(
            cli.command,
            Some(Command::Write {
                object: ObjectReference::new(ObjectType::AnalogValue, 3).unwrap(),
                value: -2.5,
                priority: 16,
                target: TargetArgs::default(),
            })
        );
    }

    #[test]
    fn test_priority_range_enforced() {
        for priority in ["0", "17"] {
            assert!(Cli::try_parse_from([
                "heitz-reader",
                "release",
                "bo:1",
                "--priority",
                priority
            ])
            .is_err());
        }

        let cli = Cli::try_parse_from(["heitz-reader", "release", "bo:1", "-p", "8"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Release { priority: 8, .. })));
    }

    #[test]
    fn test_device_overrides_apply_to_config() {
        let cli = Cli::try_parse_from([
            "heitz-reader",
            "write",
            "av:3",
            "21",
            "--device-ip",
            "10.0.0.9",
            "--device-port",
            "47809",
        ])
        .unwrap();
        let Some(Command::Write { target, .. }) = cli.command else {
            panic!("expected write");
        };

        let mut config = AgentConfig::default();
        target.apply(&mut config);
        assert_eq!(config.bacnet.target_address, "10.0.0.9");
        assert_eq!(config.bacnet.target_port, 47809);

        // Absent flags leave the config alone.
        let mut config = AgentConfig::default();
        TargetArgs::default().apply(&mut config);
        assert_eq!(config.bacnet, AgentConfig::default().bacnet);
    }

    #[test]
    fn test_only_service_commands_need_backend() {
        let object = ObjectReference::new(ObjectType::AnalogInput, 1).unwrap();
        assert!(Command::Run.needs_backend());
        assert!(Command::CheckConfig.needs_backend());
        assert!(!Command::Stats.needs_backend());
        assert!(!Command::Read {
            object,
            target: TargetArgs::default()
        }
        .needs_backend());
        assert!(!Command::Release {
            object,
            priority: 16,
            target: TargetArgs::default()
        }
        .needs_backend());
    }

    #[test]
    fn test_read_rejects_bad_object() {
        assert!(Cli::try_parse_from(["heitz-reader", "read", "pump"]).is_err());
    }

    #[test]
    fn test_check_config_subcommand() {
        let cli = Cli::try_parse_from(["heitz-reader", "--json", "check-config"]).unwrap();
        assert_eq!(cli.command, Some(Command::CheckConfig));
        assert!(cli.json);
    }
}
