//! Capability surface of the disk backend.
//!
//! The engine only ever talks to disk storage through the two traits
//! below. `local` is the flat-image driver behind `-l`; `memory` is the
//! in-memory disk used by tests and development. A driver for the
//! proprietary remote disk library implements the same traits and lives
//! outside this crate.

pub mod local;
pub mod memory;

use std::str::FromStr;

use crate::error::{DumpError, Result};
use crate::workfile::ConnParams;
use crate::SECTOR_SIZE;

/// Minimum chunk size (in sectors) accepted by allocated-block queries;
/// smaller requests are clamped up to this.
pub const MIN_CHUNK_SECTORS: u64 = 128;

/// Upper bound on the number of chunks covered by a single
/// allocated-block query.
pub const MAX_CHUNKS_PER_QUERY: u64 = 512 * 1024;

/// Identity advertised to the backend around remote sessions.
pub const ACCESS_IDENTITY: &str = "vixdump";

/// Cylinders/heads/sectors tuple as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Geometry {
    pub cylinders: u32,
    pub heads: u32,
    pub sectors: u32,
}

/// Bus adapter a disk is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AdapterType {
    Ide = 1,
    BusLogic = 2,
    LsiLogic = 3,
}

impl AdapterType {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(Self::Ide),
            2 => Some(Self::BusLogic),
            3 => Some(Self::LsiLogic),
            _ => None,
        }
    }
}

/// Static description of an open disk handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskInfo {
    /// Capacity in sectors.
    pub capacity_sectors: u64,
    pub bios_geometry: Geometry,
    pub phys_geometry: Geometry,
    pub adapter_type: AdapterType,
    pub logical_sector_size: u32,
    pub physical_sector_size: u32,
}

impl DiskInfo {
    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_sectors * SECTOR_SIZE
    }
}

/// Allocated range reported by the backend, in sectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorRange {
    pub offset: u64,
    pub length: u64,
}

impl SectorRange {
    pub fn to_byte_extent(self) -> crate::extent::Extent {
        crate::extent::Extent::new(self.offset * SECTOR_SIZE, self.length * SECTOR_SIZE)
    }
}

/// Layout used when creating a local clone disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiskType {
    #[default]
    MonolithicSparse,
    MonolithicFlat,
    SplitSparse,
    SplitFlat,
    VmfsFlat,
    StreamOptimized,
    VmfsThin,
    VmfsSparse,
}

impl DiskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MonolithicSparse => "monolithic_sparse",
            Self::MonolithicFlat => "monolithic_flat",
            Self::SplitSparse => "split_sparse",
            Self::SplitFlat => "split_flat",
            Self::VmfsFlat => "vmfs_flat",
            Self::StreamOptimized => "optimized",
            Self::VmfsThin => "vmfs_thin",
            Self::VmfsSparse => "vmfs_sparse",
        }
    }
}

impl FromStr for DiskType {
    type Err = DumpError;

    fn from_str(s: &str) -> Result<Self> {
        const TYPES: [DiskType; 8] = [
            DiskType::MonolithicSparse,
            DiskType::MonolithicFlat,
            DiskType::SplitSparse,
            DiskType::SplitFlat,
            DiskType::VmfsFlat,
            DiskType::StreamOptimized,
            DiskType::VmfsThin,
            DiskType::VmfsSparse,
        ];
        TYPES
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| DumpError::Config(format!("unknown disktype {s}")))
    }
}

/// How a connection is established.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub read_only: bool,
    /// Snapshot to attach to; dumps read from a snapshot, restores do not.
    pub snapshot_ref: Option<String>,
    /// Force a specific transport instead of letting the driver pick.
    pub force_transport: Option<String>,
    /// Operate on a local image instead of a remote VM disk.
    pub local: bool,
}

/// Parameters for creating a clone disk.
#[derive(Debug, Clone, Copy)]
pub struct CreateSpec {
    pub capacity_sectors: u64,
    pub disk_type: DiskType,
    pub adapter_type: AdapterType,
}

/// Connection-level capabilities of a disk backend.
///
/// A session holds exactly one connection; handles opened from it are
/// accessed from one task at a time by construction.
#[allow(async_fn_in_trait)]
pub trait Backend: Sized {
    type Disk: VirtualDisk;

    /// Establish a connection. `params` is `None` only for local images.
    async fn connect(params: Option<&ConnParams>, opts: &ConnectOptions) -> Result<Self>;

    /// Release stale leases left behind by crashed sessions. Callable
    /// without a live connection.
    async fn cleanup_stale(params: Option<&ConnParams>) -> Result<()>;

    /// Advisory: announce the upcoming remote session.
    async fn prepare_for_access(params: &ConnParams, identity: &str) -> Result<()>;

    /// Advisory: withdraw a `prepare_for_access` announcement.
    async fn end_access(params: &ConnParams, identity: &str) -> Result<()>;

    async fn open(&mut self, path: &str, read_only: bool) -> Result<Self::Disk>;

    async fn create(&mut self, path: &str, spec: &CreateSpec) -> Result<()>;

    async fn disconnect(self) -> Result<()>;
}

/// An open disk handle. All offsets and lengths are in sectors; buffers
/// must be a whole number of sectors long.
#[allow(async_fn_in_trait)]
pub trait VirtualDisk {
    fn info(&self) -> DiskInfo;

    async fn read_sectors(&mut self, sector_offset: u64, buf: &mut [u8]) -> Result<()>;

    async fn write_sectors(&mut self, sector_offset: u64, buf: &[u8]) -> Result<()>;

    /// Allocated ranges inside `[sector_offset, sector_offset + sector_count)`,
    /// reported at `chunk_sectors` granularity, sorted and disjoint.
    async fn query_allocated(
        &mut self,
        sector_offset: u64,
        sector_count: u64,
        chunk_sectors: u64,
    ) -> Result<Vec<SectorRange>>;

    async fn metadata_keys(&mut self) -> Result<Vec<String>>;

    async fn read_metadata(&mut self, key: &str) -> Result<Vec<u8>>;

    async fn write_metadata(&mut self, key: &str, value: &[u8]) -> Result<()>;

    async fn close(self) -> Result<()>;
}
