use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use tracing::{debug, trace};

use super::BackendStorageFile;
use crate::error::Result;

/// Local file accessed with positional reads and writes on the blocking pool.
#[derive(Debug, Clone)]
pub struct DiskFile {
    file: Arc<File>,
    path: PathBuf,
    name: String,
}

impl DiskFile {
    /// Opens `path` for reading and writing, creating it if missing.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let open_path = path.clone();
        let file = tokio::task::spawn_blocking(move || {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&open_path)
        })
        .await
        .map_err(std::io::Error::other)??;
        debug!("Opened disk backend {:?}", path);
        Ok(Self {
            file: Arc::new(file),
            name: path.display().to_string(),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&File) -> std::io::Result<T> + Send + 'static,
    {
        let file = self.file.clone();
        let out = tokio::task::spawn_blocking(move || f(&file))
            .await
            .map_err(std::io::Error::other)??;
        Ok(out)
    }
}

#[async_trait]
impl BackendStorageFile for DiskFile {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let len = buf.len();
        let data = self
            .blocking(move |f| {
                let mut out = vec![0u8; len];
                let mut filled = 0;
                while filled < len {
                    match f.read_at(&mut out[filled..], offset + filled as u64) {
                        Ok(0) => break,
                        Ok(n) => filled += n,
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                }
                out.truncate(filled);
                Ok(out)
            })
            .await?;
        buf[..data.len()].copy_from_slice(&data);
        trace!("{} read {} bytes at {}", self.name, data.len(), offset);
        Ok(data.len())
    }

    async fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        let data = buf.to_vec();
        let n = data.len();
        self.blocking(move |f| f.write_all_at(&data, offset)).await?;
        trace!("{} wrote {} bytes at {}", self.name, n, offset);
        Ok(n)
    }

    async fn truncate(&self, size: u64) -> Result<()> {
        self.blocking(move |f| f.set_len(size)).await
    }

    async fn close(&self) -> Result<()> {
        self.sync().await
    }

    async fn stat(&self) -> Result<(u64, SystemTime)> {
        self.blocking(|f| {
            let meta = f.metadata()?;
            Ok((meta.len(), meta.modified()?))
        })
        .await
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn sync(&self) -> Result<()> {
        self.blocking(|f| f.sync_all()).await
    }
}
