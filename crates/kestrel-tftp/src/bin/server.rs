// Kestrel TFTP server binary

use clap::Parser;
use kestrel_tftp::audit::AuditLogger;
use kestrel_tftp::config::{
    LogFormat, LoggingConfig, SUPERVISED_IDLE_SECS, TftpConfig, load_config, validate_config,
    write_config,
};
use kestrel_tftp::{FsResolver, Result, TftpError, TftpServer};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

#[derive(Parser, Debug)]
#[command(name = "kestrel-tftpd", about = "Read-only TFTP server for network boot")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "/etc/kestrel/tftp.toml")]
    config: PathBuf,

    /// Write a configuration file (defaults plus overrides) and exit
    #[arg(long)]
    init_config: bool,

    /// Validate the configuration and exit (no socket bind)
    #[arg(long)]
    check_config: bool,

    /// Root directory to serve files from
    #[arg(long)]
    root_dir: Option<PathBuf>,

    /// Bind address for the well-known socket
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Port for the well-known socket
    #[arg(long)]
    port: Option<u16>,

    /// Exit after this many idle seconds (0 = never)
    #[arg(long)]
    idle: Option<u64>,

    /// Default per-packet timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Largest block size a client may negotiate
    #[arg(short = 'B', long)]
    max_blksize: Option<u64>,

    /// Account to run as after binding, when started as root
    #[arg(long)]
    user: Option<String>,

    /// Log at info level
    #[arg(short, long)]
    verbose: bool,

    /// Log at debug level
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        load_config(&cli.config)?
    } else {
        TftpConfig::default()
    };

    let inherited = inherited_socket();

    if let Some(root_dir) = cli.root_dir {
        config.root_dir = root_dir;
    }
    if let Some(bind_addr) = cli.bind {
        config.bind_addr = bind_addr;
    }
    if let Some(port) = cli.port {
        config.bind_addr.set_port(port);
    }
    if inherited.is_some() && config.idle_timeout_secs == 0 {
        config.idle_timeout_secs = SUPERVISED_IDLE_SECS;
    }
    if let Some(idle) = cli.idle {
        config.idle_timeout_secs = idle;
    }
    if let Some(timeout) = cli.timeout {
        config.timeout.default = timeout;
    }
    if let Some(max_blksize) = cli.max_blksize {
        config.blksize.max = max_blksize;
    }
    if let Some(user) = cli.user {
        config.user = user;
    }
    if cli.debug {
        config.logging.level = "debug".to_string();
    } else if cli.verbose {
        config.logging.level = "info".to_string();
    }

    if cli.init_config {
        write_config(&cli.config, &config)?;
        println!("Wrote config to {}", cli.config.display());
        return Ok(());
    }

    if cli.check_config {
        validate_config(&config, false)?;
        println!("Config OK: {}", cli.config.display());
        return Ok(());
    }

    // An inherited socket is already bound; don't probe the address
    validate_config(&config, inherited.is_none())?;

    let _log_guard = init_logging(&config.logging)?;
    AuditLogger::set_enabled(config.logging.audit_enabled);

    let resolver = Arc::new(FsResolver::new(config.root_dir.clone()));
    let supervised = inherited.is_some();
    let server = match inherited {
        Some(socket) => {
            info!("Serving on socket inherited from supervisor");
            TftpServer::from_std(socket, resolver, config.policy())?
        }
        None => TftpServer::bind(config.bind_addr, resolver, config.policy())?,
    }
    .with_idle_timeout(config.idle_timeout());

    drop_privileges(&config.user)?;

    let local_addr = server.local_addr()?;
    AuditLogger::server_started(
        local_addr,
        &config.root_dir.display().to_string(),
        supervised,
    );

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            shutdown.cancel();
        }
    });

    let reason = server.run().await?;
    info!("Server stopped: {}", reason);
    AuditLogger::server_stopped(&reason.to_string());
    Ok(())
}

fn init_logging(logging: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let (writer, guard) = if let Some(ref log_file) = logging.file {
        let dir = match log_file.parent() {
            Some(path) => path,
            None => std::path::Path::new("."),
        };
        let file_name = log_file
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| TftpError::Tftp("logging.file must include a file name".to_string()))?;
        let file_appender = tracing_appender::rolling::never(dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        (BoxMakeWriter::new(non_blocking), Some(guard))
    } else {
        (BoxMakeWriter::new(std::io::stderr), None)
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(logging.level.clone()))
        .with_writer(writer);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }

    Ok(guard)
}

/// A datagram socket on stdin means we were started by inetd/xinetd.
#[cfg(unix)]
fn inherited_socket() -> Option<std::net::UdpSocket> {
    use socket2::{Socket, Type};
    use std::os::fd::AsFd;

    let fd = std::io::stdin().as_fd().try_clone_to_owned().ok()?;
    let socket = Socket::from(fd);
    match socket.r#type() {
        Ok(ty) if ty == Type::DGRAM => Some(socket.into()),
        _ => None,
    }
}

#[cfg(not(unix))]
fn inherited_socket() -> Option<std::net::UdpSocket> {
    None
}

#[cfg(unix)]
fn drop_privileges(user: &str) -> Result<()> {
    use nix::unistd::{Uid, User, setgid, setuid};

    if !Uid::effective().is_root() {
        return Ok(());
    }

    let account = User::from_name(user)
        .map_err(|e| TftpError::Io(e.into()))?
        .ok_or_else(|| TftpError::InvalidConfig(format!("unknown user {}", user)))?;

    #[cfg(target_os = "linux")]
    nix::unistd::setgroups(&[account.gid]).map_err(|e| TftpError::Io(e.into()))?;
    setgid(account.gid).map_err(|e| TftpError::Io(e.into()))?;
    setuid(account.uid).map_err(|e| TftpError::Io(e.into()))?;

    info!("Running as {} (uid {})", user, account.uid);
    Ok(())
}

#[cfg(not(unix))]
fn drop_privileges(user: &str) -> Result<()> {
    tracing::warn!("Cannot switch to {} on this platform", user);
    Ok(())
}
