//! In-memory disk backend.
//!
//! The test double behind every engine property test, and a convenient
//! development backend: disks are plain byte vectors, allocated extents
//! and geometry can be scripted, and faults can be injected at a chosen
//! call count. Handles share state through `Arc`, so a test can keep a
//! clone and inspect the disk after the session consumed the backend.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::backend::{
    AdapterType, Backend, ConnectOptions, CreateSpec, DiskInfo, Geometry, SectorRange,
    VirtualDisk,
};
use crate::error::{DumpError, Result};
use crate::workfile::ConnParams;
use crate::SECTOR_SIZE;

fn injected_fault(op: &str) -> DumpError {
    DumpError::backend(16000, format!("injected {op} fault"))
}

#[derive(Debug, Default)]
struct DiskState {
    data: Vec<u8>,
    allocated: Option<Vec<SectorRange>>,
    metadata: BTreeMap<String, Vec<u8>>,
    geometry: Option<Geometry>,
    fail_reads_after: Option<u64>,
    fail_writes_after: Option<u64>,
    read_calls: u64,
    write_calls: u64,
    max_io_sectors: u64,
}

/// One in-memory disk, shared between the backend registry, open
/// handles, and the test that provisioned it.
#[derive(Debug, Clone, Default)]
pub struct MemoryDisk {
    state: Arc<Mutex<DiskState>>,
}

impl MemoryDisk {
    pub fn new(capacity_sectors: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(DiskState {
                data: vec![0u8; (capacity_sectors * SECTOR_SIZE) as usize],
                ..Default::default()
            })),
        }
    }

    /// A disk filled with a deterministic per-sector pattern, handy for
    /// asserting that bytes ended up at the right offsets.
    pub fn with_pattern(capacity_sectors: u64) -> Self {
        let disk = Self::new(capacity_sectors);
        {
            let mut state = disk.state.lock().unwrap();
            for (i, byte) in state.data.iter_mut().enumerate() {
                *byte = ((i / SECTOR_SIZE as usize) % 251) as u8;
            }
        }
        disk
    }

    pub fn set_allocated(&self, ranges: Vec<SectorRange>) {
        self.state.lock().unwrap().allocated = Some(ranges);
    }

    pub fn set_geometry(&self, geometry: Geometry) {
        self.state.lock().unwrap().geometry = Some(geometry);
    }

    pub fn set_metadata(&self, key: &str, value: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .metadata
            .insert(key.to_string(), value.to_vec());
    }

    /// Fail every read after `calls` successful ones.
    pub fn fail_reads_after(&self, calls: u64) {
        self.state.lock().unwrap().fail_reads_after = Some(calls);
    }

    /// Fail every write after `calls` successful ones.
    pub fn fail_writes_after(&self, calls: u64) {
        self.state.lock().unwrap().fail_writes_after = Some(calls);
    }

    pub fn data(&self) -> Vec<u8> {
        self.state.lock().unwrap().data.clone()
    }

    pub fn metadata(&self) -> BTreeMap<String, Vec<u8>> {
        self.state.lock().unwrap().metadata.clone()
    }

    pub fn write_calls(&self) -> u64 {
        self.state.lock().unwrap().write_calls
    }

    /// Largest sector count seen in a single read or write call.
    pub fn max_io_sectors(&self) -> u64 {
        self.state.lock().unwrap().max_io_sectors
    }

    fn info_locked(state: &DiskState) -> DiskInfo {
        let capacity_sectors = state.data.len() as u64 / SECTOR_SIZE;
        let geometry = state.geometry.unwrap_or(Geometry {
            cylinders: (capacity_sectors / (16 * 63)) as u32,
            heads: 16,
            sectors: 63,
        });
        DiskInfo {
            capacity_sectors,
            bios_geometry: geometry,
            phys_geometry: geometry,
            adapter_type: AdapterType::BusLogic,
            logical_sector_size: SECTOR_SIZE as u32,
            physical_sector_size: SECTOR_SIZE as u32,
        }
    }
}

/// An open handle onto a [`MemoryDisk`].
pub struct MemoryDiskHandle {
    disk: MemoryDisk,
    read_only: bool,
}

impl MemoryDiskHandle {
    fn check_io(state: &mut DiskState, sector_offset: u64, buf_len: usize) -> Result<()> {
        if buf_len == 0 || buf_len % SECTOR_SIZE as usize != 0 {
            return Err(DumpError::backend(
                0,
                format!("buffer of {buf_len} bytes is not a whole number of sectors"),
            ));
        }
        let sectors = buf_len as u64 / SECTOR_SIZE;
        let capacity = state.data.len() as u64 / SECTOR_SIZE;
        if sector_offset + sectors > capacity {
            return Err(DumpError::backend(
                0,
                format!("access at sector {sector_offset}+{sectors} past end of disk"),
            ));
        }
        state.max_io_sectors = state.max_io_sectors.max(sectors);
        Ok(())
    }
}

impl VirtualDisk for MemoryDiskHandle {
    fn info(&self) -> DiskInfo {
        MemoryDisk::info_locked(&self.disk.state.lock().unwrap())
    }

    async fn read_sectors(&mut self, sector_offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut state = self.disk.state.lock().unwrap();
        if let Some(limit) = state.fail_reads_after {
            if state.read_calls >= limit {
                return Err(injected_fault("read"));
            }
        }
        Self::check_io(&mut state, sector_offset, buf.len())?;
        state.read_calls += 1;

        let start = (sector_offset * SECTOR_SIZE) as usize;
        buf.copy_from_slice(&state.data[start..start + buf.len()]);
        Ok(())
    }

    async fn write_sectors(&mut self, sector_offset: u64, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(DumpError::backend(0, "handle is read-only"));
        }
        let mut state = self.disk.state.lock().unwrap();
        if let Some(limit) = state.fail_writes_after {
            if state.write_calls >= limit {
                return Err(injected_fault("write"));
            }
        }
        Self::check_io(&mut state, sector_offset, buf.len())?;
        state.write_calls += 1;

        let start = (sector_offset * SECTOR_SIZE) as usize;
        state.data[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    async fn query_allocated(
        &mut self,
        sector_offset: u64,
        sector_count: u64,
        _chunk_sectors: u64,
    ) -> Result<Vec<SectorRange>> {
        let state = self.disk.state.lock().unwrap();
        let span_end = sector_offset + sector_count;

        let Some(ranges) = &state.allocated else {
            return Ok(vec![SectorRange {
                offset: sector_offset,
                length: sector_count,
            }]);
        };

        // Clip the scripted list to the queried span.
        Ok(ranges
            .iter()
            .filter_map(|r| {
                let start = r.offset.max(sector_offset);
                let end = (r.offset + r.length).min(span_end);
                (start < end).then_some(SectorRange {
                    offset: start,
                    length: end - start,
                })
            })
            .collect())
    }

    async fn metadata_keys(&mut self) -> Result<Vec<String>> {
        Ok(self.disk.state.lock().unwrap().metadata.keys().cloned().collect())
    }

    async fn read_metadata(&mut self, key: &str) -> Result<Vec<u8>> {
        self.disk
            .state
            .lock()
            .unwrap()
            .metadata
            .get(key)
            .cloned()
            .ok_or_else(|| DumpError::backend(0, format!("no such metadata key: {key}")))
    }

    async fn write_metadata(&mut self, key: &str, value: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(DumpError::backend(0, "handle is read-only"));
        }
        self.disk
            .state
            .lock()
            .unwrap()
            .metadata
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn close(self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct BackendState {
    disks: BTreeMap<String, MemoryDisk>,
    read_opens: u64,
    write_opens: u64,
}

/// Registry of in-memory disks; clones share state so tests can observe
/// what the session did.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<BackendState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_disk(&self, path: &str, disk: MemoryDisk) {
        self.inner
            .lock()
            .unwrap()
            .disks
            .insert(path.to_string(), disk);
    }

    pub fn disk(&self, path: &str) -> Option<MemoryDisk> {
        self.inner.lock().unwrap().disks.get(path).cloned()
    }

    pub fn read_opens(&self) -> u64 {
        self.inner.lock().unwrap().read_opens
    }

    pub fn write_opens(&self) -> u64 {
        self.inner.lock().unwrap().write_opens
    }
}

impl Backend for MemoryBackend {
    type Disk = MemoryDiskHandle;

    async fn connect(_params: Option<&ConnParams>, _opts: &ConnectOptions) -> Result<Self> {
        Ok(Self::new())
    }

    async fn cleanup_stale(_params: Option<&ConnParams>) -> Result<()> {
        Ok(())
    }

    async fn prepare_for_access(_params: &ConnParams, _identity: &str) -> Result<()> {
        Ok(())
    }

    async fn end_access(_params: &ConnParams, _identity: &str) -> Result<()> {
        Ok(())
    }

    async fn open(&mut self, path: &str, read_only: bool) -> Result<MemoryDiskHandle> {
        let mut state = self.inner.lock().unwrap();
        let disk = state
            .disks
            .get(path)
            .cloned()
            .ok_or_else(|| DumpError::backend(0, format!("no such disk: {path}")))?;
        if read_only {
            state.read_opens += 1;
        } else {
            state.write_opens += 1;
        }
        Ok(MemoryDiskHandle { disk, read_only })
    }

    async fn create(&mut self, path: &str, spec: &CreateSpec) -> Result<()> {
        self.add_disk(path, MemoryDisk::new(spec.capacity_sectors));
        Ok(())
    }

    async fn disconnect(self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_write_roundtrip() {
        let backend = MemoryBackend::new();
        backend.add_disk("disk0", MemoryDisk::new(16));

        let mut b = backend.clone();
        let mut handle = b.open("disk0", false).await.unwrap();

        let data = vec![7u8; 512];
        handle.write_sectors(3, &data).await.unwrap();

        let mut read_back = vec![0u8; 512];
        handle.read_sectors(3, &mut read_back).await.unwrap();
        assert_eq!(read_back, data);

        assert_eq!(backend.disk("disk0").unwrap().write_calls(), 1);
    }

    #[tokio::test]
    async fn test_query_allocated_clips_to_span() {
        let disk = MemoryDisk::new(1000);
        disk.set_allocated(vec![
            SectorRange {
                offset: 0,
                length: 100,
            },
            SectorRange {
                offset: 500,
                length: 300,
            },
        ]);

        let backend = MemoryBackend::new();
        backend.add_disk("disk0", disk);
        let mut b = backend.clone();
        let mut handle = b.open("disk0", true).await.unwrap();

        let ranges = handle.query_allocated(50, 500, 128).await.unwrap();
        assert_eq!(
            ranges,
            vec![
                SectorRange {
                    offset: 50,
                    length: 50
                },
                SectorRange {
                    offset: 500,
                    length: 50
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_injected_read_fault() {
        let disk = MemoryDisk::new(16);
        disk.fail_reads_after(1);

        let backend = MemoryBackend::new();
        backend.add_disk("disk0", disk);
        let mut b = backend.clone();
        let mut handle = b.open("disk0", true).await.unwrap();

        let mut buf = vec![0u8; 512];
        handle.read_sectors(0, &mut buf).await.unwrap();
        let err = handle.read_sectors(1, &mut buf).await.unwrap_err();
        assert!(matches!(err, DumpError::Backend { code: 16000, .. }));
    }

    #[tokio::test]
    async fn test_open_counts_visible_through_clone() {
        let backend = MemoryBackend::new();
        backend.add_disk("disk0", MemoryDisk::new(16));

        let mut b = backend.clone();
        b.open("disk0", true).await.unwrap();
        b.open("disk0", false).await.unwrap();

        assert_eq!(backend.read_opens(), 1);
        assert_eq!(backend.write_opens(), 1);
    }
}
