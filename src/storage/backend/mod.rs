//! Byte-range storage backends a volume is written through.
//!
//! The needle and index code only ever talks to [`BackendStorageFile`], so a
//! local file, an in-memory buffer or a remote object can sit underneath.

mod disk;
mod memory;

use std::io::ErrorKind;
use std::time::SystemTime;

use async_trait::async_trait;

use crate::error::Result;

pub use disk::DiskFile;
pub use memory::MemoryFile;

#[async_trait]
pub trait BackendStorageFile: Send + Sync {
    /// Positional read. Returns fewer bytes than `buf.len()` only at end of file.
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    async fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize>;

    async fn truncate(&self, size: u64) -> Result<()>;

    async fn close(&self) -> Result<()>;

    /// Current length and modification time.
    async fn stat(&self) -> Result<(u64, SystemTime)>;

    fn name(&self) -> &str;

    async fn sync(&self) -> Result<()> {
        Ok(())
    }

    /// Reads exactly `buf.len()` bytes or fails with `UnexpectedEof`.
    async fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let n = self.read_at(buf, offset).await?;
        if n < buf.len() {
            return Err(std::io::Error::new(
                ErrorKind::UnexpectedEof,
                format!(
                    "{}: short read of {} bytes at offset {}, wanted {}",
                    self.name(),
                    n,
                    offset,
                    buf.len()
                ),
            )
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exercise(file: &dyn BackendStorageFile) {
        assert_eq!(file.stat().await.unwrap().0, 0);
        file.write_at(b"hello world", 0).await.unwrap();
        file.write_at(b"WORLD", 6).await.unwrap();
        assert_eq!(file.stat().await.unwrap().0, 11);

        let mut buf = vec![0u8; 11];
        assert_eq!(file.read_at(&mut buf, 0).await.unwrap(), 11);
        assert_eq!(&buf, b"hello WORLD");

        // reads past the end are short, not errors
        let mut tail = vec![0u8; 8];
        assert_eq!(file.read_at(&mut tail, 6).await.unwrap(), 5);
        assert!(file.read_exact_at(&mut tail, 6).await.is_err());

        file.truncate(5).await.unwrap();
        assert_eq!(file.stat().await.unwrap().0, 5);
        let mut buf = vec![0u8; 5];
        file.read_exact_at(&mut buf, 0).await.unwrap();
        assert_eq!(&buf, b"hello");
        file.sync().await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_backend() {
        let file = MemoryFile::new("mem");
        exercise(&file).await;
        assert_eq!(file.name(), "mem");
    }

    #[tokio::test]
    async fn test_disk_backend() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1.dat");
        let file = DiskFile::open(&path).await.unwrap();
        exercise(&file).await;
        file.close().await.unwrap();

        // data survives reopening
        let file = DiskFile::open(&path).await.unwrap();
        assert_eq!(file.stat().await.unwrap().0, 5);
    }
}
