use clap::{Parser, Subcommand};
use ptftp::config::{LoggingConfig, load_config, validate_config, write_config};
use ptftp::{
    AuditSink, LogFormat, NullAuditSink, Result, SessionSettings, TftpConfig, TftpError,
    TftpServer, TracingAuditSink, bind_udp_socket,
};
use ptftp_roots::FileRootRegistry;
use std::net::{IpAddr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ptftp-server", about = "Read-only TFTP server for network boot")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "/etc/ptftp/ptftp.toml")]
    config: PathBuf,

    /// Write the effective configuration to --config and exit
    #[arg(long)]
    init_config: bool,

    /// Validate the configuration and exit (no socket bind)
    #[arg(long)]
    check_config: bool,

    /// Bind address for the well-known socket (IPv4)
    #[arg(long)]
    bind: Option<SocketAddrV4>,

    /// Directory holding one root entry per client IP
    #[arg(long)]
    roots_dir: Option<PathBuf>,

    /// Maximum concurrent sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Log filter, e.g. "info" or "ptftp=debug"
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Manage the per-client roots in roots.dir
    Roots {
        #[command(subcommand)]
        action: RootsAction,
    },
}

#[derive(Subcommand, Debug)]
enum RootsAction {
    /// Serve files to CLIENT_IP from PATH ("0.0.0.0" for any client)
    Set { client_ip: IpAddr, path: PathBuf },
    /// Remove the root entry of CLIENT_IP
    Remove { client_ip: IpAddr },
    /// Print all root entries
    List,
}

fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::new(config.level.clone());
    let Some(ref log_file) = config.file else {
        match config.format {
            LogFormat::Json => tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .init(),
            LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        }
        return Ok(None);
    };

    let dir = match log_file.parent() {
        Some(path) => path,
        None => std::path::Path::new("."),
    };
    let file_name = log_file
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| TftpError::Config("logging.file must include a file name".to_string()))?;
    let file_appender = tracing_appender::rolling::never(dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    match config.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(non_blocking)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(non_blocking)
            .init(),
    }
    Ok(Some(guard))
}

fn run_roots_command(config: &TftpConfig, action: RootsAction) -> Result<()> {
    let dir = config.roots.dir.clone().ok_or_else(|| {
        TftpError::Config("roots commands need roots.dir (or --roots-dir)".to_string())
    })?;
    let registry = FileRootRegistry::new(dir);
    match action {
        RootsAction::Set { client_ip, path } => {
            registry.set_root(&client_ip.to_string(), &path)?;
            println!("{} -> {}", client_ip, path.display());
        }
        RootsAction::Remove { client_ip } => {
            if registry.remove_root(&client_ip.to_string())? {
                println!("Removed {}", client_ip);
            } else {
                println!("{} had no root", client_ip);
            }
        }
        RootsAction::List => {
            for (client_ip, root) in registry.list_roots()? {
                println!("{} -> {}", client_ip, root.display());
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        load_config(&cli.config)?
    } else {
        TftpConfig::default()
    };

    if let Some(bind_addr) = cli.bind {
        config.bind_addr = bind_addr;
    }
    if let Some(roots_dir) = cli.roots_dir {
        config.roots.dir = Some(roots_dir);
    }
    if let Some(max_sessions) = cli.max_sessions {
        config.max_sessions = max_sessions;
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }

    if cli.init_config {
        write_config(&cli.config, &config)?;
        println!("Wrote config to {}", cli.config.display());
        return Ok(());
    }

    if let Some(Command::Roots { action }) = cli.command {
        return run_roots_command(&config, action);
    }

    if cli.check_config {
        validate_config(&config, false)?;
        println!("Config OK: {}", cli.config.display());
        return Ok(());
    }

    validate_config(&config, true)?;
    let _log_guard = init_logging(&config.logging)?;

    let audit: Arc<dyn AuditSink> = if config.logging.audit_enabled {
        Arc::new(TracingAuditSink)
    } else {
        Arc::new(NullAuditSink)
    };
    let socket = bind_udp_socket(*config.bind_addr.ip(), config.bind_addr.port()).await?;
    let mut server = TftpServer::new(
        socket,
        config.roots.registry(),
        SessionSettings::from(&config.session),
        audit,
    );

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, shutting down");
                shutdown.cancel();
            }
            Err(e) => error!("Failed to listen for interrupt: {}", e),
        }
    });

    server.serve_forever(config.max_sessions).await?;
    if server.active_sessions() > 0 {
        warn!(
            "Waiting for {} sessions to finish",
            server.active_sessions()
        );
    }
    server.wait_requests_done().await
}
