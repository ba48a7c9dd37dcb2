//! Local-filesystem `FileAccessor`: preallocate via `posix_fallocate`
//! (falling back to `set_len`), pwrite-style concurrent writes, atomic
//! rename-based finalize.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[cfg(unix)]
use std::os::unix::fs::FileExt;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;

use crate::error::KetchError;
use crate::storage::accessor::FileAccessor;

fn disk_err(e: impl std::error::Error + Send + Sync + 'static) -> KetchError {
    KetchError::Disk(anyhow::Error::new(e))
}

/// Concurrent offset writer for a `.part` file. Clone-safe; every
/// `write_at` is independent (pwrite-style on Unix).
pub struct LocalFileAccessor {
    file: Arc<File>,
    temp_path: PathBuf,
}

impl LocalFileAccessor {
    /// Creates (truncating) a new temp file and preallocates it to `size`.
    pub fn create(temp_path: &Path, size: i64) -> Result<Self, KetchError> {
        let file = File::options()
            .write(true)
            .read(true)
            .create(true)
            .truncate(true)
            .open(temp_path)
            .map_err(disk_err)?;
        let accessor = Self { file: Arc::new(file), temp_path: temp_path.to_path_buf() };
        if size > 0 {
            accessor.preallocate(size)?;
        }
        Ok(accessor)
    }

    /// Opens an already-preallocated temp file for a resumed download.
    pub fn open_existing(temp_path: &Path) -> Result<Self, KetchError> {
        let file = File::options().read(true).write(true).open(temp_path).map_err(disk_err)?;
        Ok(Self { file: Arc::new(file), temp_path: temp_path.to_path_buf() })
    }
}

impl FileAccessor for LocalFileAccessor {
    fn write_at(&self, offset: i64, data: &[u8]) -> Result<(), KetchError> {
        let offset = offset as u64;
        #[cfg(unix)]
        {
            let n = self.file.write_at(data, offset).map_err(disk_err)?;
            if n != data.len() {
                return Err(KetchError::Disk(anyhow::anyhow!("short write: {n} of {}", data.len())));
            }
            Ok(())
        }
        #[cfg(not(unix))]
        {
            use std::io::{Seek, SeekFrom, Write};
            let mut f = (*self.file).try_clone().map_err(disk_err)?;
            f.seek(SeekFrom::Start(offset)).map_err(disk_err)?;
            f.write_all(data).map_err(disk_err)?;
            Ok(())
        }
    }

    fn preallocate(&self, size: i64) -> Result<(), KetchError> {
        let size = size as u64;
        #[cfg(unix)]
        {
            let fd = self.file.as_raw_fd();
            let r = unsafe { libc::posix_fallocate(fd, 0, size as libc::off_t) };
            if r == 0 {
                return Ok(());
            }
            tracing::debug!(errno = r, "posix_fallocate failed, falling back to set_len");
        }
        self.file.set_len(size).map_err(disk_err)
    }

    fn size(&self) -> Result<i64, KetchError> {
        let meta = self.file.metadata().map_err(disk_err)?;
        Ok(meta.len() as i64)
    }

    fn flush(&self) -> Result<(), KetchError> {
        self.file.sync_all().map_err(disk_err)
    }

    fn close(&self, final_path: &Path) -> Result<(), KetchError> {
        std::fs::rename(&self.temp_path, final_path).map_err(disk_err)
    }

    fn delete(&self) -> Result<(), KetchError> {
        match std::fs::remove_file(&self.temp_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(disk_err(e)),
        }
    }
}
