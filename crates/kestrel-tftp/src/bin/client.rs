// Kestrel TFTP client binary

use clap::{ArgAction, Parser};
use kestrel_tftp::{ClientOptions, MAX_BLOCK_SIZE, Result, TftpClient, TftpError};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Fetch a file from a TFTP server
#[derive(Parser, Debug)]
#[command(name = "kestrel-tftp-client")]
#[command(about = "Read-only TFTP client", long_about = None)]
struct Cli {
    /// TFTP server address (e.g., 192.168.1.100:69)
    #[arg(short, long)]
    server: String,

    /// Remote file to download
    #[arg(short, long)]
    get: String,

    /// Local destination (defaults to the remote file's base name)
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Block size to request (8-65464 bytes)
    #[arg(short, long)]
    blksize: Option<usize>,

    /// Timeout in seconds, requested from the server and used locally
    #[arg(short, long, default_value_t = 5)]
    timeout: u64,

    /// Request the transfer size
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    tsize: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_target(false)
        .init();

    let server_addr: SocketAddr = cli
        .server
        .parse()
        .map_err(|e| TftpError::Tftp(format!("Invalid server address: {}", e)))?;

    let blksize = match cli.blksize {
        Some(size) if !(8..=MAX_BLOCK_SIZE).contains(&size) => {
            warn!("Invalid block size {}, not requesting one", size);
            None
        }
        other => other,
    };

    let client = TftpClient::new(
        server_addr,
        ClientOptions {
            blksize,
            timeout: Some(cli.timeout),
            tsize: cli.tsize,
            wait: Duration::from_secs(cli.timeout),
        },
    );

    let local_file = cli.file.unwrap_or_else(|| {
        PathBuf::from(cli.get.rsplit('/').next().unwrap_or(cli.get.as_str()))
    });

    info!(
        "Downloading {} from {} to {}",
        cli.get,
        server_addr,
        local_file.display()
    );
    let start = Instant::now();
    let download = client.get(&cli.get).await?;
    tokio::fs::write(&local_file, &download.data).await?;

    info!(
        "Download complete: {} bytes in {} blocks of {} ({:.2}s)",
        download.data.len(),
        download.blocks,
        download.blksize,
        start.elapsed().as_secs_f64()
    );
    if !download.negotiated.is_empty() {
        info!("Negotiated options: {:?}", download.negotiated);
    }

    Ok(())
}
