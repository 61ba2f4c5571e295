//! Content served to boot clients
//!
//! The transfer engine never touches the filesystem directly. It asks a
//! [`ContentResolver`] for a sanitized path and gets back a
//! [`ReadableSource`] that supports positional reads, so a session can
//! re-read any block without a shared cursor.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Random-access byte content with a fixed size.
#[async_trait]
pub trait ReadableSource: Send + Sync + fmt::Debug {
    fn size(&self) -> u64;

    /// Read up to `len` bytes starting at `offset`. Returns fewer bytes only
    /// at the end of the content. Implementations backed by blocking I/O
    /// must not run it on the calling task.
    async fn read_at(&self, offset: u64, len: usize) -> io::Result<Bytes>;
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("access denied: {0}")]
    Denied(String),

    #[error("backend failure: {0}")]
    Backend(#[from] io::Error),
}

/// Maps a sanitized request path to content for one client.
#[async_trait]
pub trait ContentResolver: Send + Sync {
    async fn resolve(
        &self,
        path: &str,
        client: SocketAddr,
    ) -> Result<Arc<dyn ReadableSource>, ResolveError>;
}

/// Content held in memory, e.g. a rendered config file.
#[derive(Debug, Clone)]
pub struct MemorySource {
    data: Bytes,
}

impl MemorySource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

#[async_trait]
impl ReadableSource for MemorySource {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    async fn read_at(&self, offset: u64, len: usize) -> io::Result<Bytes> {
        let start = usize::try_from(offset)
            .unwrap_or(usize::MAX)
            .min(self.data.len());
        let end = start.saturating_add(len).min(self.data.len());
        Ok(self.data.slice(start..end))
    }
}

/// A regular file opened read-only. The size is taken once at open time
/// and reads run on the blocking thread pool.
#[derive(Debug)]
pub struct FileSource {
    file: Arc<File>,
    size: u64,
}

impl FileSource {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            size,
        })
    }
}

#[async_trait]
impl ReadableSource for FileSource {
    fn size(&self) -> u64 {
        self.size
    }

    async fn read_at(&self, offset: u64, len: usize) -> io::Result<Bytes> {
        let remaining = self.size.saturating_sub(offset);
        let want = len.min(usize::try_from(remaining).unwrap_or(usize::MAX));
        if want == 0 {
            return Ok(Bytes::new());
        }

        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || read_fully_at(&file, offset, want))
            .await
            .map_err(io::Error::other)?
    }
}

fn read_fully_at(file: &File, offset: u64, want: usize) -> io::Result<Bytes> {
    let mut buf = vec![0u8; want];
    let mut filled = 0;

    while filled < want {
        match positional_read(file, &mut buf[filled..], offset + filled as u64) {
            Ok(0) => break, // file shrank underneath us
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    buf.truncate(filled);
    Ok(Bytes::from(buf))
}

#[cfg(unix)]
fn positional_read(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(windows)]
fn positional_read(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}

/// Serves regular files below a boot root directory.
///
/// Symlinks are followed, but the final target must still lie inside the
/// root.
#[derive(Debug, Clone)]
pub struct FsResolver {
    root: PathBuf,
}

impl FsResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn open(root: &Path, path: &str) -> Result<FileSource, ResolveError> {
        let file_path = root.join(path);

        let canonical_file = match file_path.canonicalize() {
            Ok(p) => p,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ResolveError::NotFound(path.to_string()));
            }
            Err(e) => return Err(ResolveError::Backend(e)),
        };
        let canonical_root = root.canonicalize()?;

        if !canonical_file.starts_with(&canonical_root) {
            warn!(
                "{} resolves outside the boot root ({})",
                path,
                canonical_file.display()
            );
            return Err(ResolveError::Denied(path.to_string()));
        }

        if !std::fs::metadata(&canonical_file)?.is_file() {
            return Err(ResolveError::NotFound(path.to_string()));
        }

        FileSource::open(&canonical_file).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => ResolveError::NotFound(path.to_string()),
            io::ErrorKind::PermissionDenied => ResolveError::Denied(path.to_string()),
            _ => ResolveError::Backend(e),
        })
    }
}

#[async_trait]
impl ContentResolver for FsResolver {
    async fn resolve(
        &self,
        path: &str,
        client: SocketAddr,
    ) -> Result<Arc<dyn ReadableSource>, ResolveError> {
        debug!("{} requested {} from {}", client, path, self.root.display());

        let root = self.root.clone();
        let owned_path = path.to_string();
        let source = tokio::task::spawn_blocking(move || Self::open(&root, &owned_path))
            .await
            .map_err(io::Error::other)??;

        Ok(Arc::new(source))
    }
}

/// Fixed table of in-memory files keyed by sanitized path.
#[derive(Debug, Clone, Default)]
pub struct MemoryResolver {
    files: HashMap<String, MemorySource>,
}

impl MemoryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, data: impl Into<Bytes>) {
        self.files.insert(path.into(), MemorySource::new(data));
    }

    pub fn with_file(mut self, path: impl Into<String>, data: impl Into<Bytes>) -> Self {
        self.insert(path, data);
        self
    }
}

#[async_trait]
impl ContentResolver for MemoryResolver {
    async fn resolve(
        &self,
        path: &str,
        _client: SocketAddr,
    ) -> Result<Arc<dyn ReadableSource>, ResolveError> {
        match self.files.get(path) {
            Some(source) => Ok(Arc::new(source.clone())),
            None => Err(ResolveError::NotFound(path.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn client() -> SocketAddr {
        "192.0.2.10:2000".parse().unwrap()
    }

    #[tokio::test]
    async fn memory_source_reads_are_bounded() {
        let source = MemorySource::new(&b"0123456789"[..]);
        assert_eq!(source.size(), 10);
        assert_eq!(&source.read_at(0, 4).await.unwrap()[..], b"0123");
        assert_eq!(&source.read_at(8, 4).await.unwrap()[..], b"89");
        assert!(source.read_at(10, 4).await.unwrap().is_empty());
        assert!(source.read_at(u64::MAX, 4).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_source_reads_at_offsets() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[7u8; 1500]).unwrap();
        file.flush().unwrap();

        let source = FileSource::open(file.path()).unwrap();
        assert_eq!(source.size(), 1500);
        assert_eq!(source.read_at(1024, 1024).await.unwrap().len(), 476);
        assert_eq!(source.read_at(512, 512).await.unwrap().len(), 512);
        assert!(source.read_at(1500, 512).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn concurrent_file_reads_complete_on_one_thread() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let content: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        file.write_all(&content).unwrap();
        file.flush().unwrap();
        let source = Arc::new(FileSource::open(file.path()).unwrap());

        // Concurrent block reads on a single-threaded runtime all complete
        // and each sees its own offset.
        let mut reads = tokio::task::JoinSet::new();
        for block in 0..8u64 {
            let source = Arc::clone(&source);
            reads.spawn(async move { (block, source.read_at(block * 512, 512).await) });
        }
        while let Some(joined) = reads.join_next().await {
            let (block, payload) = joined.unwrap();
            let start = (block * 512) as usize;
            assert_eq!(&payload.unwrap()[..], &content[start..start + 512]);
        }
    }

    #[tokio::test]
    async fn fs_resolver_serves_files_under_root() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("images/fedora")).unwrap();
        std::fs::write(root.path().join("images/fedora/vmlinuz"), b"kernel").unwrap();

        let resolver = FsResolver::new(root.path());
        let source = resolver
            .resolve("images/fedora/vmlinuz", client())
            .await
            .unwrap();
        assert_eq!(source.size(), 6);
        assert_eq!(&source.read_at(0, 512).await.unwrap()[..], b"kernel");
    }

    #[tokio::test]
    async fn fs_resolver_reports_missing_and_directories_as_not_found() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("pxelinux.cfg")).unwrap();
        let resolver = FsResolver::new(root.path());

        assert!(matches!(
            resolver.resolve("missing.0", client()).await,
            Err(ResolveError::NotFound(_))
        ));
        assert!(matches!(
            resolver.resolve("pxelinux.cfg", client()).await,
            Err(ResolveError::NotFound(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn fs_resolver_refuses_symlinks_leaving_root() {
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("shadow"), b"secret").unwrap();
        let root = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path().join("shadow"), root.path().join("link"))
            .unwrap();

        let resolver = FsResolver::new(root.path());
        assert!(matches!(
            resolver.resolve("link", client()).await,
            Err(ResolveError::Denied(_))
        ));
    }

    #[tokio::test]
    async fn memory_resolver_matches_exact_paths() {
        let resolver = MemoryResolver::new().with_file("pxelinux.cfg/default", "DEFAULT local\n");
        let source = resolver
            .resolve("pxelinux.cfg/default", client())
            .await
            .unwrap();
        assert_eq!(source.size(), 14);
        assert!(resolver.resolve("pxelinux.cfg/Default", client()).await.is_err());
    }
}
