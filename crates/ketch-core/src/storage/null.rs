//! No-op `FileAccessor` for sources with `manages_own_file_io() == true`
//! (§6.4): the coordinator still has to hand every `DownloadContext` a
//! `FileAccessor`, but a source that writes its own destination (e.g. a
//! multi-file archive extractor) has nothing for it to do.

use crate::error::KetchError;
use crate::storage::accessor::FileAccessor;

#[derive(Debug, Default, Clone, Copy)]
pub struct NullFileAccessor;

impl FileAccessor for NullFileAccessor {
    fn write_at(&self, _offset: i64, _data: &[u8]) -> Result<(), KetchError> {
        Ok(())
    }

    fn preallocate(&self, _size: i64) -> Result<(), KetchError> {
        Ok(())
    }

    fn size(&self) -> Result<i64, KetchError> {
        Ok(0)
    }

    fn flush(&self) -> Result<(), KetchError> {
        Ok(())
    }

    fn close(&self, _final_path: &std::path::Path) -> Result<(), KetchError> {
        Ok(())
    }

    fn delete(&self) -> Result<(), KetchError> {
        Ok(())
    }
}
