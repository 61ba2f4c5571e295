use thiserror::Error;

#[derive(Error, Debug)]
pub enum TftpError {
    #[error("TFTP error: {0}")]
    Tftp(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Malformed packet: {0}")]
    Decode(#[from] crate::packet::DecodeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TftpError>;
