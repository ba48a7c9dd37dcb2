use crate::error::KetchError;

/// File-system collaborator (§6.2, §1 — explicitly out of scope as a
/// pluggable interface). All I/O failures map to `KetchError::Disk`.
/// Owned exclusively by the running task (§3 Ownership and lifecycle);
/// random-access writes from different segments may arrive concurrently,
/// so implementations must serialize anything that isn't independent
/// (fsync, size queries) per §5 "Shared resources".
pub trait FileAccessor: Send + Sync {
    fn write_at(&self, offset: i64, data: &[u8]) -> Result<(), KetchError>;
    fn preallocate(&self, size: i64) -> Result<(), KetchError>;
    fn size(&self) -> Result<i64, KetchError>;
    fn flush(&self) -> Result<(), KetchError>;
    /// Finalizes the file at `final_path` (atomic rename from the temp
    /// path) and releases the handle.
    fn close(&self, final_path: &std::path::Path) -> Result<(), KetchError>;
    /// Best-effort delete of the partial file (§4.5 step 8, `cancel`).
    fn delete(&self) -> Result<(), KetchError>;
}
