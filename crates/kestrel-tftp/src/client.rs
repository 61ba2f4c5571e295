//! Minimal read-only TFTP client, used by `kestrel-tftp-client` and the
//! integration tests.

use bytes::{Bytes, BytesMut};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::error::{Result, TftpError};
use crate::options::OptionKind;
use crate::packet::{DEFAULT_BLOCK_SIZE, MAX_PACKET_SIZE, Packet};

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Requested `blksize`; not sent when `None`.
    pub blksize: Option<usize>,
    /// Requested `timeout` in seconds; not sent when `None`.
    pub timeout: Option<u64>,
    /// Ask the server for the transfer size.
    pub tsize: bool,
    /// How long to wait for each server packet.
    pub wait: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            blksize: None,
            timeout: None,
            tsize: true,
            wait: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Download {
    pub data: Bytes,
    /// Options from the server's OACK, empty when none was sent.
    pub negotiated: Vec<(String, String)>,
    pub blksize: usize,
    pub blocks: u64,
}

pub struct TftpClient {
    server: SocketAddr,
    options: ClientOptions,
}

impl TftpClient {
    pub fn new(server: SocketAddr, options: ClientOptions) -> Self {
        Self { server, options }
    }

    /// Download `remote_file` into memory.
    pub async fn get(&self, remote_file: &str) -> Result<Download> {
        let bind_addr: SocketAddr = if self.server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind_addr).await?;

        let rrq = Packet::Rrq {
            filename: remote_file.to_string(),
            mode: "octet".to_string(),
            options: self.requested_options(),
        };
        socket.send_to(&rrq.encode(), self.server).await?;
        debug!("Sent RRQ for {} to {}", remote_file, self.server);

        let mut blksize = DEFAULT_BLOCK_SIZE;
        let mut tsize: Option<u64> = None;
        let mut negotiated = Vec::new();
        let mut data = BytesMut::new();
        let mut blocks = 0u64;
        let mut last_block_full = false;
        let mut server_tid: Option<SocketAddr> = None;
        let mut buf = vec![0u8; MAX_PACKET_SIZE];

        loop {
            let (len, from) =
                match tokio::time::timeout(self.options.wait, socket.recv_from(&mut buf)).await {
                    Ok(received) => received?,
                    Err(_) if tsize.is_none() && blocks > 0 && last_block_full => {
                        // Without tsize a size that is a multiple of blksize
                        // has no short final block to end on
                        warn!("Server went quiet after a full block, assuming end of file");
                        break;
                    }
                    Err(_) => return Err(TftpError::Tftp("Timeout waiting for data".into())),
                };

            // The first reply fixes the server's transfer ID
            match server_tid {
                None => {
                    server_tid = Some(from);
                    debug!("Server TID: {}", from);
                }
                Some(tid) if tid != from => {
                    warn!("Ignoring packet from unexpected source: {}", from);
                    continue;
                }
                Some(_) => {}
            }

            match Packet::decode(&buf[..len])? {
                Packet::Oack { options } => {
                    for (name, value) in &options {
                        match OptionKind::from_name(name) {
                            Some(OptionKind::BlockSize) => {
                                blksize = value.parse().unwrap_or(blksize);
                            }
                            Some(OptionKind::TransferSize) => tsize = value.parse().ok(),
                            Some(OptionKind::Timeout) | None => {}
                        }
                    }
                    debug!("Received OACK {:?}, sending ACK 0", options);
                    negotiated = options;
                    send_ack(&socket, 0, from).await?;
                }
                Packet::Data { block, payload } => {
                    let expected = ((blocks + 1) & 0xFFFF) as u16;
                    send_ack(&socket, block, from).await?;
                    if block != expected {
                        debug!("Duplicate block {} (expecting {})", block, expected);
                        continue;
                    }

                    data.extend_from_slice(&payload);
                    blocks += 1;
                    last_block_full = payload.len() == blksize;
                    if !last_block_full {
                        break;
                    }
                }
                Packet::Error { code, message } => {
                    return Err(TftpError::Tftp(format!(
                        "Server error {}: {}",
                        code, message
                    )));
                }
                other => {
                    return Err(TftpError::Tftp(format!(
                        "Unexpected opcode: {:?}",
                        other.opcode()
                    )));
                }
            }

            if tsize.is_some_and(|size| data.len() as u64 >= size) {
                break;
            }
        }

        info!(
            "Transfer of {} complete: {} bytes in {} blocks",
            remote_file,
            data.len(),
            blocks
        );

        Ok(Download {
            data: data.freeze(),
            negotiated,
            blksize,
            blocks,
        })
    }

    fn requested_options(&self) -> Vec<(String, String)> {
        let mut options = Vec::new();
        if let Some(blksize) = self.options.blksize {
            options.push(("blksize".to_string(), blksize.to_string()));
        }
        if let Some(timeout) = self.options.timeout {
            options.push(("timeout".to_string(), timeout.to_string()));
        }
        if self.options.tsize {
            options.push(("tsize".to_string(), "0".to_string()));
        }
        options
    }
}

async fn send_ack(socket: &UdpSocket, block: u16, to: SocketAddr) -> Result<()> {
    socket.send_to(&Packet::Ack { block }.encode(), to).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_only_configured_options() {
        let server: SocketAddr = "127.0.0.1:69".parse().unwrap();

        let client = TftpClient::new(
            server,
            ClientOptions {
                tsize: false,
                ..Default::default()
            },
        );
        assert!(client.requested_options().is_empty());

        let client = TftpClient::new(
            server,
            ClientOptions {
                blksize: Some(1428),
                timeout: Some(3),
                ..Default::default()
            },
        );
        assert_eq!(
            client.requested_options(),
            vec![
                ("blksize".to_string(), "1428".to_string()),
                ("timeout".to_string(), "3".to_string()),
                ("tsize".to_string(), "0".to_string()),
            ]
        );
    }
}
