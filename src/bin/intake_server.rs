//! Intake relay gRPC server
//!
//! Hosts one intake session: the form edits through unary RPCs and staff
//! dashboards follow the record through `StaffUpdates` streams.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tonic::transport::Server;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use intake_relay::storage::persistent::open_snapshot_store;
use intake_relay::transport::IntakeRelayService;
use intake_relay::{
    ActivityConfig, ChannelConfig, DistributionChannel, InProcessChannel, IntakeConfig, IntakeSession,
    RequiredFields, SnapshotStore,
};

/// Server configuration
struct Config {
    /// Address to bind to
    addr: SocketAddr,
    /// Snapshot directory; no persistence when unset
    data_dir: Option<PathBuf>,
    /// Resume the latest stored record on startup
    restore: bool,
    intake: IntakeConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 50051)),
            data_dir: None,
            restore: false,
            intake: IntakeConfig::default(),
        }
    }
}

fn fail(msg: &str) -> ! {
    eprintln!("error: {msg}");
    std::process::exit(1);
}

fn value_of(args: &[String], i: usize, flag: &str) -> String {
    args.get(i + 1)
        .cloned()
        .unwrap_or_else(|| fail(&format!("{flag} requires a value")))
}

fn parse_args() -> Config {
    let args: Vec<String> = std::env::args().collect();
    let mut config = Config::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" | "-p" => {
                let raw = value_of(&args, i, "--port");
                let port: u16 = raw
                    .parse()
                    .unwrap_or_else(|_| fail(&format!("invalid port number: {raw}")));
                config.addr.set_port(port);
                i += 2;
            }
            "--bind" | "-b" => {
                let raw = value_of(&args, i, "--bind");
                config.addr = raw
                    .parse()
                    .unwrap_or_else(|_| fail(&format!("invalid socket address: {raw}")));
                i += 2;
            }
            "--data-dir" | "-d" => {
                config.data_dir = Some(PathBuf::from(value_of(&args, i, "--data-dir")));
                i += 2;
            }
            "--restore" => {
                config.restore = true;
                i += 1;
            }
            "--idle-ms" => {
                let raw = value_of(&args, i, "--idle-ms");
                let ms: u64 = raw
                    .parse()
                    .unwrap_or_else(|_| fail(&format!("invalid idle window: {raw}")));
                config.intake.activity = ActivityConfig {
                    idle_window: Duration::from_millis(ms),
                };
                i += 2;
            }
            "--no-replay" => {
                config.intake.channel.replay_last_on_subscribe = false;
                i += 1;
            }
            "--queue-capacity" => {
                let raw = value_of(&args, i, "--queue-capacity");
                config.intake.channel.observer_queue_capacity = raw
                    .parse()
                    .unwrap_or_else(|_| fail(&format!("invalid queue capacity: {raw}")));
                i += 2;
            }
            "--required" => {
                let raw = value_of(&args, i, "--required");
                config.intake.required_fields = match raw.as_str() {
                    "dashboard" => RequiredFields::dashboard(),
                    "registration" => RequiredFields::registration(),
                    list => RequiredFields::parse(list.split(',')).unwrap_or_else(|e| fail(&e.to_string())),
                };
                i += 2;
            }
            "--help" | "-h" => {
                println!("intake-server - realtime patient intake relay");
                println!();
                println!("USAGE:");
                println!("    intake-server [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!("    -p, --port <PORT>             Port to listen on [default: 50051]");
                println!("    -b, --bind <ADDR>             Socket address to bind [default: 127.0.0.1:50051]");
                println!("    -d, --data-dir <DIR>          Persist snapshots in DIR");
                println!("        --restore                 Resume the latest stored record");
                println!("        --idle-ms <MS>            Idle window before `inactive` [default: 10000]");
                println!("        --no-replay               Do not replay the last snapshot to new observers");
                println!("        --queue-capacity <N>      Per-observer queue capacity [default: 1024]");
                println!("        --required <SET>          dashboard | registration | comma-separated fields");
                println!("    -h, --help                    Print help information");
                std::process::exit(0);
            }
            arg => fail(&format!("unknown argument: {arg}")),
        }
    }

    config
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive("intake_relay=info".parse()?))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = parse_args();
    let intake = config.intake.validate()?;

    let channel_cfg: ChannelConfig = intake.channel.clone();
    let channel: Arc<dyn DistributionChannel> = Arc::new(InProcessChannel::new(channel_cfg));

    let mut builder = IntakeSession::builder(Arc::clone(&channel))
        .config(intake)
        .restore_latest(config.restore);
    if let Some(dir) = &config.data_dir {
        // Holds an exclusive directory lock for the process lifetime.
        let store: Arc<dyn SnapshotStore> = Arc::new(open_snapshot_store(dir, None)?);
        info!(dir = %dir.display(), "snapshot persistence enabled");
        builder = builder.persistence(store);
    }
    let session = builder.build()?;

    let svc = IntakeRelayService::new(session.clone(), channel).into_server();

    info!(version = env!("CARGO_PKG_VERSION"), addr = %config.addr, "intake relay listening");

    Server::builder()
        .add_service(svc)
        .serve_with_shutdown(config.addr, async {
            let _ = signal::ctrl_c().await;
        })
        .await?;

    session.close();
    info!("shut down");
    Ok(())
}
