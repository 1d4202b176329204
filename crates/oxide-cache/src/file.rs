//! Archive file shared between transfer workers.
//!
//! Workers read or write disjoint ranges with positional I/O, so the handle
//! needs no cursor and no lock. The descriptor closes when the last clone
//! drops, after every worker has joined.

use crate::chunk::ChunkRange;
use oxide_core::{Error, Result};
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct SharedFile {
    file: Arc<File>,
    len: u64,
}

impl SharedFile {
    /// Open an archive for reading.
    pub async fn open(path: &Path) -> Result<Self> {
        let path = path.to_path_buf();
        blocking(move || {
            let file = File::open(&path)?;
            let len = file.metadata()?.len();
            Ok(Self {
                file: Arc::new(file),
                len,
            })
        })
        .await
    }

    /// Create (or truncate) a destination sized to `len` bytes.
    pub async fn create(path: &Path, len: u64) -> Result<Self> {
        let path = path.to_path_buf();
        blocking(move || {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)?;
            file.set_len(len)?;
            Ok(Self {
                file: Arc::new(file),
                len,
            })
        })
        .await
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read exactly the bytes of `range`.
    pub async fn read_range(&self, range: ChunkRange) -> Result<Vec<u8>> {
        let file = self.file.clone();
        blocking(move || {
            let mut buf = vec![0u8; range.size() as usize];
            read_exact_at(&file, &mut buf, range.start)?;
            Ok(buf)
        })
        .await
    }

    /// Write `data` starting at `offset`.
    pub async fn write_at(&self, offset: u64, data: Vec<u8>) -> Result<()> {
        let file = self.file.clone();
        blocking(move || {
            write_all_at(&file, &data, offset)?;
            Ok(())
        })
        .await
    }

    /// Flush file contents to disk.
    pub async fn sync(&self) -> Result<()> {
        let file = self.file.clone();
        blocking(move || Ok(file.sync_all()?)).await
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Internal(format!("File task failed: {}", e)))?
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset)? {
            0 => return Err(std::io::ErrorKind::UnexpectedEof.into()),
            n => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, offset)? {
            0 => return Err(std::io::ErrorKind::WriteZero.into()),
            n => {
                buf = &buf[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}
