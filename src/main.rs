use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tracing::{info, warn, Level};

use gdut_drcom::config::{Config, SessionConfig};
use gdut_drcom::session;
use gdut_drcom::shutdown::{shutdown_channel, ShutdownTrigger};

#[derive(Parser)]
#[command(name = "gdut-drcom", version, about = "A DrCom keep-alive client for GDUT campus networks")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the client
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Config file (multi-session mode)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Remote IP
    #[arg(short = 'i', long)]
    remote_ip: Option<IpAddr>,

    /// Remote port
    #[arg(short = 'p', long, default_value_t = 61440)]
    port: u16,

    /// KeepAlive1 flag
    #[arg(short = 'k', long, default_value_t = 0xdc)]
    keep_alive1_flag: u8,

    /// Enable crypt
    #[arg(short, long)]
    enable_crypt: bool,

    /// Bind device
    #[arg(short, long)]
    bind_device: Option<String>,

    /// Log file
    #[arg(short = 'f', long)]
    log_file: Option<PathBuf>,

    /// Debug mode
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => match args.config.clone() {
            Some(path) => run_multi(&path).await,
            None => run_single(args).await,
        },
    }
}

async fn run_single(args: RunArgs) {
    let Some(remote_ip) = args.remote_ip else {
        eprintln!("remote ip is required");
        std::process::exit(1);
    };
    if args.port == 0 {
        eprintln!("invalid remote port: 0");
        std::process::exit(1);
    }

    init_logging(args.log_file.as_deref(), args.debug);
    info!(tag = "global", "gdut-drcom {}", env!("CARGO_PKG_VERSION"));

    let (trigger, shutdown) = shutdown_channel();
    spawn_signal_listener(trigger);

    let config = SessionConfig {
        tag: "core".to_string(),
        remote_ip,
        remote_port: args.port,
        keep_alive1_flag: args.keep_alive1_flag,
        enable_crypt: args.enable_crypt,
        bind_device: args.bind_device,
        bind_to_addr: false,
    };
    let result = session::run_session(config, shutdown).await;

    info!(tag = "global", "Bye");
    if result.is_err() {
        std::process::exit(1);
    }
}

async fn run_multi(path: &Path) {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            eprintln!("read config file failed: {}", e);
            std::process::exit(1);
        }
    };
    let config: Config = match serde_json::from_str(&raw) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("parse config file failed: {}", e);
            std::process::exit(1);
        }
    };

    let log_file = config.log_file.as_deref().filter(|f| !f.is_empty()).map(Path::new);
    init_logging(log_file, config.debug);
    info!(tag = "global", "gdut-drcom {}", env!("CARGO_PKG_VERSION"));

    let (trigger, shutdown) = shutdown_channel();
    spawn_signal_listener(trigger);

    session::run_sessions(config.core.into_vec(), shutdown).await;

    info!(tag = "global", "Bye");
}

fn init_logging(log_file: Option<&Path>, debug: bool) {
    let max_level = if debug { Level::DEBUG } else { Level::INFO };
    let builder = tracing_subscriber::fmt().with_max_level(max_level);

    match log_file {
        Some(path) => {
            // the log file is recreated on every start, world read/writable
            let _ = fs::remove_file(path);
            let file = match fs::File::create(path) {
                Ok(file) => file,
                Err(e) => {
                    eprintln!("open log file failed: {}", e);
                    std::process::exit(1);
                }
            };
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = file.set_permissions(fs::Permissions::from_mode(0o666));
            }
            builder.with_ansi(false).with_writer(Arc::new(file)).init();
        }
        None => builder.init(),
    }
}

fn spawn_signal_listener(trigger: ShutdownTrigger) {
    tokio::spawn(async move {
        wait_for_signal().await;
        warn!(tag = "global", "receive signal, exit");
        trigger.trigger();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
