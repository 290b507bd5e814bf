//! Session orchestration: dump, restore, and show.
//!
//! Each invocation runs exactly one session. The session owns every
//! resource it acquires (connection, disk handles, raw mirror, pipeline)
//! and releases them in reverse acquisition order on every exit path.

mod dump;
mod restore;

pub use dump::{dump, DumpStats};
pub use restore::{restore, show};

use std::path::PathBuf;

use crate::backend::{Backend, DiskType, MIN_CHUNK_SECTORS, ACCESS_IDENTITY};
use crate::error::{DumpError, Result};
use crate::workfile::ConnParams;

/// Default number of sectors moved per backend call (512 KiB).
pub const DEFAULT_SECTORS_PER_CALL: u64 = 1024;

/// Everything that used to be a process-wide knob, constructed once from
/// the parsed command line.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Upper bound on sectors moved per backend call.
    pub sectors_per_call: u64,
    /// Chunk size (sectors) for the allocated-block query; clamped to
    /// the backend minimum at query time.
    pub chunk_sectors: u64,
    /// Query allocated blocks; when disabled the whole disk counts as
    /// allocated.
    pub query_allocated: bool,
    pub save_metadata: bool,
    pub restore_metadata: bool,
    /// Overlap backend I/O with stream I/O through the copy pipeline.
    pub pipelined: bool,
    /// Validate disk geometry before restoring.
    pub check_size: bool,
    /// Create the clone disk instead of opening an existing one.
    pub create_disk: bool,
    /// Operate on a local image rather than a remote VM disk.
    pub local: bool,
    /// Clone disk path; on restore this overrides the work file's target.
    pub clone_disk_path: Option<String>,
    /// Mirror dump payload into this raw image file.
    pub raw_image_path: Option<PathBuf>,
    /// Layout for a locally created clone disk.
    pub disk_type: DiskType,
    /// Release stale backend leases when the session starts.
    pub cleanup_before: bool,
    /// Release stale backend leases after disconnecting.
    pub cleanup_after: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            sectors_per_call: DEFAULT_SECTORS_PER_CALL,
            chunk_sectors: MIN_CHUNK_SECTORS,
            query_allocated: true,
            save_metadata: false,
            restore_metadata: false,
            pipelined: false,
            check_size: true,
            create_disk: false,
            local: false,
            clone_disk_path: None,
            raw_image_path: None,
            disk_type: DiskType::default(),
            cleanup_before: false,
            cleanup_after: false,
        }
    }
}

impl SessionOptions {
    /// Size of one transfer buffer.
    pub(crate) fn buffer_len(&self) -> usize {
        (self.sectors_per_call * crate::SECTOR_SIZE) as usize
    }
}

fn no_handle() -> DumpError {
    DumpError::Config("cannot process data: no disk handle opened".to_string())
}

/// Tear the connection down: disconnect, withdraw the advisory access
/// announcement, and run the post-disconnect cleanup when requested.
async fn finish_backend<B: Backend>(
    backend: B,
    conn: Option<&ConnParams>,
    opts: &SessionOptions,
) -> Result<()> {
    let mut first: Option<DumpError> = None;

    if let Err(e) = backend.disconnect().await {
        first.get_or_insert(e);
    }

    if !opts.local {
        if let Some(params) = conn {
            // Advisory; failure to withdraw the announcement is not fatal.
            if let Err(e) = B::end_access(params, ACCESS_IDENTITY).await {
                tracing::warn!(error = %e, "failed to end backend access");
            }
        }
    }

    if opts.cleanup_after {
        if let Err(e) = B::cleanup_stale(conn).await {
            first.get_or_insert(e);
        }
    }

    match first {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
