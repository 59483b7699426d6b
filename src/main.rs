//! disguise-tunnel: disguise chain probe and configuration tool
//!
//! The tunnel core is embedded by a host application that owns the virtual
//! interface and the secure-channel client. This binary validates profile
//! files and probes a profile's disguise chain from the command line.
//!
//! # Usage
//!
//! ```bash
//! # Probe the active profile's disguise chain
//! ./disguise-tunnel -c /path/to/config.json
//!
//! # Probe a specific profile with debug logging
//! DISGUISE_TUNNEL_PROFILE=cdn DISGUISE_TUNNEL_LOG_LEVEL=debug ./disguise-tunnel
//! ```

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;
use tokio::signal;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

use disguise_tunnel::classify::classify;
use disguise_tunnel::config::{load_config_with_env, AppConfig, TunnelConfig};
use disguise_tunnel::error::TunnelError;
use disguise_tunnel::protect::{default_protector, SharedProtector};
use disguise_tunnel::transport::{build_chain, TransportError};

/// How long the probe waits for the server's first bytes
const BANNER_TIMEOUT: Duration = Duration::from_secs(5);

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Generate default configuration
    generate_config: bool,
    /// Check configuration only
    check_config: bool,
    /// Profile to probe instead of the active one
    profile: Option<String>,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from("config.json");
        let mut generate_config = false;
        let mut check_config = false;
        let mut profile = None;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "-p" | "--profile" => {
                    profile = args.next();
                }
                "-g" | "--generate-config" => {
                    generate_config = true;
                }
                "--check" => {
                    check_config = true;
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("disguise-tunnel v{}", disguise_tunnel::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            config_path,
            generate_config,
            check_config,
            profile,
        }
    }
}

fn print_help() {
    println!(
        r#"disguise-tunnel v{}

Disguised transport chain for mobile SSH tunneling.

USAGE:
    disguise-tunnel [OPTIONS]

Without --check or --generate-config, connects the selected profile's
disguise chain and prints the first bytes the server sends.

OPTIONS:
    -c, --config <PATH>     Configuration file path [default: config.json]
    -p, --profile <ID>      Profile to probe [default: active_profile]
    -g, --generate-config   Generate default configuration and exit
    --check                 Check configuration and exit
    -h, --help              Print help information
    -v, --version           Print version information

ENVIRONMENT:
    DISGUISE_TUNNEL_LOG_LEVEL    Override log level (trace, debug, info, warn, error)
    DISGUISE_TUNNEL_PROFILE      Override the active profile id
"#,
        disguise_tunnel::VERSION
    );
}

/// Initialize logging
fn init_logging(config: &AppConfig) {
    let level = match config.log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["rustls=warn", "tungstenite=warn", "tokio_tungstenite=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.log.target)
        .with_span_events(FmtSpan::CLOSE);

    if config.log.format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Socket protector from `socket_mark`
fn build_protector(config: &AppConfig) -> SharedProtector {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    if let Some(mark) = config.socket_mark {
        info!(mark, "Tunnel sockets carry routing mark");
        return std::sync::Arc::new(disguise_tunnel::protect::FwmarkProtector::new(mark));
    }

    if config.socket_mark.is_some() {
        warn!("socket_mark is not supported on this platform, ignoring");
    }
    default_protector()
}

/// Connect the disguise chain and read the server's first bytes
async fn probe(config: &AppConfig, profile: &TunnelConfig) -> Result<(), TunnelError> {
    let chain = build_chain(
        profile,
        &config.tunables,
        build_protector(config),
        config.connect_timeout(),
    )?;

    println!("profile:   {} ({})", profile.name, profile.id);
    println!("type:      {}", profile.effective_connection_type());
    println!("chain:     {}", chain.describe());

    let started = Instant::now();
    let mut stream = chain.connect().await?;
    println!(
        "connected: {:.1}ms",
        started.elapsed().as_secs_f64() * 1000.0
    );

    let mut banner = vec![0u8; 256];
    match tokio::time::timeout(BANNER_TIMEOUT, stream.read(&mut banner)).await {
        Ok(Ok(0)) => println!("server:    closed without data"),
        Ok(Ok(n)) => println!(
            "server:    {}",
            String::from_utf8_lossy(&banner[..n]).trim_end()
        ),
        Ok(Err(e)) => return Err(TransportError::from(e).into()),
        Err(_) => println!("server:    no data within {}s", BANNER_TIMEOUT.as_secs()),
    }

    Ok(())
}

/// Main application entry point
#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_config {
        disguise_tunnel::config::create_default_config(&args.config_path)?;
        println!("Generated default configuration at {:?}", args.config_path);
        return Ok(());
    }

    let mut config = load_config_with_env(&args.config_path).with_context(|| {
        format!("Failed to load configuration from {:?}", args.config_path)
    })?;

    if let Some(profile) = args.profile {
        config.active_profile = profile;
        config.validate().context("Invalid --profile")?;
    }

    if args.check_config {
        println!(
            "Configuration is valid ({} profiles, active={})",
            config.profiles.len(),
            config.active_profile
        );
        return Ok(());
    }

    init_logging(&config);
    info!("disguise-tunnel v{}", disguise_tunnel::VERSION);
    info!("Configuration loaded from {:?}", args.config_path);

    let profile = config
        .active()
        .cloned()
        .context("Active profile not found")?;

    let result = tokio::select! {
        result = probe(&config, &profile) => result,
        _ = signal::ctrl_c() => {
            info!("Received SIGINT, aborting probe");
            return Ok(());
        }
        () = wait_for_sigterm() => {
            info!("Received SIGTERM, aborting probe");
            return Ok(());
        }
    };

    if let Err(e) = result {
        let category = classify(&e);
        eprintln!("error:     {category}: {e}");
        eprintln!("           {}", category.user_message());
        std::process::exit(2);
    }

    Ok(())
}

/// Wait for SIGTERM signal
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!(error = %e, "Failed to register SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}
