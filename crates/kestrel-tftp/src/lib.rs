//! Kestrel TFTP: a read-only TFTP engine for network boot.
//!
//! Serves RRQs (RFC 1350) with `blksize`, `timeout` and `tsize` option
//! negotiation (RFC 2347/2348/2349). File content comes from a pluggable
//! [`ContentResolver`]; [`FsResolver`] serves a boot root directory and
//! [`MemoryResolver`] serves in-memory files.

pub mod audit;
pub mod client;
pub mod config;
pub mod content;
pub mod error;
pub mod filename;
pub mod idle;
pub mod options;
pub mod packet;
pub mod server;
pub mod session;

pub use client::{ClientOptions, Download, TftpClient};
pub use config::{LogFormat, LoggingConfig, TftpConfig};
pub use content::{
    ContentResolver, FileSource, FsResolver, MemoryResolver, MemorySource, ReadableSource,
    ResolveError,
};
pub use error::{Result, TftpError};
pub use options::{Bound, EffectiveSettings, Policy};
pub use packet::{DEFAULT_BLOCK_SIZE, ErrorCode, MAX_BLOCK_SIZE, Opcode, Packet};
pub use server::{Shutdown, TftpServer};
pub use session::{Outcome, SessionState, TransferSession};
