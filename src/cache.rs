//! On-disk cache keyed by the client-supplied URL.
//!
//! Entries live at `<root>/<scheme>/<host>/<path...>`. New content is written
//! into a timestamp-suffixed sibling and renamed over the final path, so a
//! reader only ever sees a complete previous entry or a complete new one.

use crate::error::ProxyError;
use log::{debug, warn};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufWriter};

const WRITE_BUFFER_SIZE: usize = 64 * 1024;
const MAX_TEMP_NAME_ATTEMPTS: u32 = 16;

/// Result of looking a cache path up on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStat {
    pub exists: bool,
    pub size: u64,
}

impl CacheStat {
    pub fn missing() -> Self {
        Self::default()
    }

    /// Freshness heuristic: the cached copy is used iff its size equals the
    /// length the origin declares now.
    pub fn is_fresh(&self, declared_length: u64) -> bool {
        self.exists && self.size == declared_length
    }
}

#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a URL string to its cache path. Pure: the same URL always yields
    /// the same path, and the result never leaves the cache root.
    ///
    /// The first two segments (`<scheme>/<host>`) are fixed; `..` only pops
    /// path segments below them, so one host can never reach another's key.
    pub fn key_for(&self, url: &str) -> PathBuf {
        let relative = url.replacen("://", "/", 1);
        let mut prefix: Vec<&str> = Vec::with_capacity(2);
        let mut segments: Vec<&str> = Vec::new();

        for segment in relative.split('/') {
            if segment.is_empty() || segment == "." {
                continue;
            }
            if prefix.len() < 2 {
                prefix.push(segment);
                continue;
            }
            match segment {
                ".." => {
                    segments.pop();
                }
                s => segments.push(s),
            }
        }

        let mut path = self.root.clone();
        for segment in prefix {
            path.push(if is_plain(segment) { segment } else { "_" });
        }
        for segment in segments {
            // A segment like `C:` must not be able to reset the join on any platform.
            if is_plain(segment) {
                path.push(segment);
            }
        }
        path
    }

    /// Missing files and stat errors both read as "no cache".
    pub async fn stat(&self, path: &Path) -> CacheStat {
        match fs::metadata(path).await {
            Ok(metadata) if metadata.is_file() => CacheStat {
                exists: true,
                size: metadata.len(),
            },
            Ok(_) => CacheStat::missing(),
            Err(e) => {
                if e.kind() != ErrorKind::NotFound {
                    debug!("Cache stat failed for {}: {}", path.display(), e);
                }
                CacheStat::missing()
            }
        }
    }

    pub async fn is_fresh(&self, path: &Path, declared_length: u64) -> bool {
        self.stat(path).await.is_fresh(declared_length)
    }

    /// Copies `reader` to completion into a new entry at `path`.
    ///
    /// On failure the temporary file is removed and any existing entry at
    /// `path` is left as it was.
    pub async fn write<R>(&self, path: &Path, reader: &mut R) -> Result<u64, ProxyError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut writer = CacheWriter::create(path).await?;
        let mut buf = vec![0u8; WRITE_BUFFER_SIZE];

        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    writer.abort().await;
                    return Err(ProxyError::StreamIo(format!("read failed for {}: {}", path.display(), e)));
                }
            };

            if let Err(e) = writer.write_chunk(&buf[..n]).await {
                writer.abort().await;
                return Err(e);
            }
        }

        writer.commit().await
    }
}

/// An in-progress cache entry backed by an exclusively owned temporary file.
///
/// Ends either in `commit` (rename onto the final path) or `abort` (temp file
/// removed). Dropping an unfinished writer also removes the temp file.
pub struct CacheWriter {
    path: PathBuf,
    tmp: PathBuf,
    file: Option<BufWriter<File>>,
    written: u64,
}

impl CacheWriter {
    pub async fn create(path: &Path) -> Result<Self, ProxyError> {
        let dir = path
            .parent()
            .ok_or_else(|| ProxyError::CacheIo(format!("cache path has no parent: {}", path.display())))?;

        fs::create_dir_all(dir)
            .await
            .map_err(|e| ProxyError::CacheIo(format!("make dir {} failed: {}", dir.display(), e)))?;

        let (file, tmp) = create_temp_sibling(path).await?;
        debug!("Created cache temp file {}", tmp.display());

        Ok(Self {
            path: path.to_path_buf(),
            tmp,
            file: Some(BufWriter::with_capacity(WRITE_BUFFER_SIZE, file)),
            written: 0,
        })
    }

    pub fn temp_path(&self) -> &Path {
        &self.tmp
    }

    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), ProxyError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| ProxyError::CacheIo("cache writer already finished".to_string()))?;

        file.write_all(chunk)
            .await
            .map_err(|e| ProxyError::CacheIo(format!("write {} failed: {}", self.tmp.display(), e)))?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// Flushes, closes and renames the temp file onto the final path.
    pub async fn commit(mut self) -> Result<u64, ProxyError> {
        let Some(mut file) = self.file.take() else {
            return Err(ProxyError::CacheIo("cache writer already finished".to_string()));
        };

        if let Err(e) = file.flush().await {
            drop(file);
            self.remove_temp().await;
            return Err(ProxyError::CacheIo(format!("flush {} failed: {}", self.tmp.display(), e)));
        }

        let mut inner = file.into_inner();
        if let Err(e) = inner.shutdown().await {
            drop(inner);
            self.remove_temp().await;
            return Err(ProxyError::CacheIo(format!("close {} failed: {}", self.tmp.display(), e)));
        }
        drop(inner);

        if let Err(e) = fs::rename(&self.tmp, &self.path).await {
            self.remove_temp().await;
            return Err(ProxyError::CacheIo(format!(
                "rename {} -> {} failed: {}",
                self.tmp.display(),
                self.path.display(),
                e
            )));
        }

        debug!("Committed {} bytes to {}", self.written, self.path.display());
        Ok(self.written)
    }

    pub async fn abort(mut self) {
        self.file.take();
        self.remove_temp().await;
        debug!("Aborted cache write for {}", self.path.display());
    }

    async fn remove_temp(&self) {
        if let Err(e) = fs::remove_file(&self.tmp).await {
            if e.kind() != ErrorKind::NotFound {
                warn!("Failed to remove temp file {}: {}", self.tmp.display(), e);
            }
        }
    }
}

#[cfg(test)]
impl CacheWriter {
    /// Swaps in an unbuffered read-only handle so the next chunk hits a
    /// failing write.
    pub(crate) async fn reopen_read_only(&mut self) {
        let file = File::open(&self.tmp).await.unwrap();
        self.file = Some(BufWriter::with_capacity(0, file));
    }
}

impl Drop for CacheWriter {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            let _ = std::fs::remove_file(&self.tmp);
        }
    }
}

fn is_plain(segment: &str) -> bool {
    Path::new(segment)
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
}

/// Opens `<path>.<unix-nanos>` with create-new semantics, bumping the suffix
/// on collision.
async fn create_temp_sibling(path: &Path) -> Result<(File, PathBuf), ProxyError> {
    let base = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| ProxyError::CacheIo(format!("system clock before unix epoch: {}", e)))?
        .as_nanos();
    let mut last_err = None;

    for attempt in 0..MAX_TEMP_NAME_ATTEMPTS {
        let mut name = path.as_os_str().to_owned();
        name.push(format!(".{}", base + u128::from(attempt)));
        let tmp = PathBuf::from(name);

        match OpenOptions::new().write(true).create_new(true).open(&tmp).await {
            Ok(file) => return Ok((file, tmp)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => last_err = Some(e),
            Err(e) => {
                return Err(ProxyError::CacheIo(format!("file create {} failed: {}", tmp.display(), e)));
            }
        }
    }

    Err(ProxyError::CacheIo(format!(
        "file create for {} failed: {}",
        path.display(),
        last_err.map(|e| e.to_string()).unwrap_or_default()
    )))
}
