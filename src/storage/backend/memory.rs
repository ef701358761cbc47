use std::time::SystemTime;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::BackendStorageFile;
use crate::error::Result;

/// Growable in-memory file. Handy for tests and for volumes that never touch disk.
#[derive(Debug)]
pub struct MemoryFile {
    name: String,
    inner: RwLock<(Vec<u8>, SystemTime)>,
}

impl MemoryFile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: RwLock::new((Vec::new(), SystemTime::now())),
        }
    }

    pub fn with_data(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            inner: RwLock::new((data, SystemTime::now())),
        }
    }

    /// Copy of the current contents.
    pub fn contents(&self) -> Vec<u8> {
        self.inner.read().0.clone()
    }
}

#[async_trait]
impl BackendStorageFile for MemoryFile {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let guard = self.inner.read();
        let data = &guard.0;
        let start = offset as usize;
        if start >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    async fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        let mut guard = self.inner.write();
        let start = offset as usize;
        let end = start + buf.len();
        if guard.0.len() < end {
            guard.0.resize(end, 0);
        }
        guard.0[start..end].copy_from_slice(buf);
        guard.1 = SystemTime::now();
        Ok(buf.len())
    }

    async fn truncate(&self, size: u64) -> Result<()> {
        let mut guard = self.inner.write();
        guard.0.resize(size as usize, 0);
        guard.1 = SystemTime::now();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn stat(&self) -> Result<(u64, SystemTime)> {
        let guard = self.inner.read();
        Ok((guard.0.len() as u64, guard.1))
    }

    fn name(&self) -> &str {
        &self.name
    }
}
