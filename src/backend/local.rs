//! Flat local-image driver.
//!
//! Backs the `-l` mode: disk images are plain files on the local
//! filesystem, one sector per 512 bytes, with disk metadata kept in a
//! JSON sidecar next to the image. The driver reports the whole image as
//! allocated; holes in a sparse source image are a property the remote
//! library tracks, not a local file.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

use crate::backend::{
    AdapterType, Backend, ConnectOptions, CreateSpec, DiskInfo, Geometry, SectorRange,
    VirtualDisk,
};
use crate::error::{DumpError, Result};
use crate::workfile::ConnParams;
use crate::SECTOR_SIZE;

const SIDECAR_SUFFIX: &str = ".meta.json";

fn backend_err(context: &str, e: io::Error) -> DumpError {
    DumpError::backend(e.raw_os_error().unwrap_or(0) as u64, format!("{context}: {e}"))
}

/// Geometry synthesized for a flat image: 16 heads and 63 sectors per
/// track, the layout virtual SCSI disks default to.
fn synthesize_geometry(capacity_sectors: u64) -> Geometry {
    Geometry {
        cylinders: (capacity_sectors / (16 * 63)).min(u32::MAX as u64) as u32,
        heads: 16,
        sectors: 63,
    }
}

pub struct LocalBackend {
    _priv: (),
}

impl Backend for LocalBackend {
    type Disk = LocalDisk;

    async fn connect(_params: Option<&ConnParams>, opts: &ConnectOptions) -> Result<Self> {
        if !opts.local {
            return Err(DumpError::Config(
                "remote vSphere sessions require the proprietary disk driver, which is not \
                 part of this build; pass -l to operate on a local image"
                    .to_string(),
            ));
        }
        if let Some(transport) = &opts.force_transport {
            tracing::debug!(%transport, "forced transport has no effect on local images");
        }
        Ok(Self { _priv: () })
    }

    async fn cleanup_stale(_params: Option<&ConnParams>) -> Result<()> {
        tracing::debug!("local images hold no leases, nothing to clean up");
        Ok(())
    }

    async fn prepare_for_access(_params: &ConnParams, identity: &str) -> Result<()> {
        tracing::debug!(identity, "prepare_for_access is a no-op for local images");
        Ok(())
    }

    async fn end_access(_params: &ConnParams, identity: &str) -> Result<()> {
        tracing::debug!(identity, "end_access is a no-op for local images");
        Ok(())
    }

    async fn open(&mut self, path: &str, read_only: bool) -> Result<LocalDisk> {
        LocalDisk::open(Path::new(path), read_only).await
    }

    async fn create(&mut self, path: &str, spec: &CreateSpec) -> Result<()> {
        tracing::debug!(
            path,
            capacity_sectors = spec.capacity_sectors,
            disk_type = spec.disk_type.as_str(),
            "creating local image"
        );

        let file = File::create(path)
            .await
            .map_err(|e| backend_err("failed to create image", e))?;
        file.set_len(spec.capacity_sectors * SECTOR_SIZE)
            .await
            .map_err(|e| backend_err("failed to size image", e))?;
        file.sync_all()
            .await
            .map_err(|e| backend_err("failed to sync image", e))?;
        Ok(())
    }

    async fn disconnect(self) -> Result<()> {
        Ok(())
    }
}

pub struct LocalDisk {
    file: File,
    path: PathBuf,
    info: DiskInfo,
    read_only: bool,
    metadata: BTreeMap<String, Vec<u8>>,
}

impl LocalDisk {
    async fn open(path: &Path, read_only: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)
            .await
            .map_err(|e| backend_err(&format!("failed to open {}", path.display()), e))?;

        let byte_len = file
            .metadata()
            .await
            .map_err(|e| backend_err("failed to stat image", e))?
            .len();
        if byte_len % SECTOR_SIZE != 0 {
            return Err(DumpError::backend(
                0,
                format!(
                    "image {} is {byte_len} bytes, not a whole number of sectors",
                    path.display()
                ),
            ));
        }

        let capacity_sectors = byte_len / SECTOR_SIZE;
        let geometry = synthesize_geometry(capacity_sectors);
        let info = DiskInfo {
            capacity_sectors,
            bios_geometry: geometry,
            phys_geometry: geometry,
            adapter_type: AdapterType::BusLogic,
            logical_sector_size: SECTOR_SIZE as u32,
            physical_sector_size: SECTOR_SIZE as u32,
        };

        let metadata = load_sidecar(&sidecar_path(path)).await?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            info,
            read_only,
            metadata,
        })
    }

    fn check_range(&self, sector_offset: u64, buf_len: usize) -> Result<()> {
        if buf_len % SECTOR_SIZE as usize != 0 {
            return Err(DumpError::backend(
                0,
                format!("buffer of {buf_len} bytes is not a whole number of sectors"),
            ));
        }
        let sectors = buf_len as u64 / SECTOR_SIZE;
        if sector_offset + sectors > self.info.capacity_sectors {
            return Err(DumpError::backend(
                0,
                format!(
                    "access at sector {sector_offset}+{sectors} past end of disk ({} sectors)",
                    self.info.capacity_sectors
                ),
            ));
        }
        Ok(())
    }

    async fn persist_metadata(&self) -> Result<()> {
        let encoded = serde_json::to_vec_pretty(&self.metadata)
            .map_err(|e| DumpError::backend(0, format!("failed to encode metadata: {e}")))?;
        tokio::fs::write(sidecar_path(&self.path), encoded)
            .await
            .map_err(|e| backend_err("failed to write metadata sidecar", e))
    }
}

fn sidecar_path(image: &Path) -> PathBuf {
    let mut name = image.as_os_str().to_os_string();
    name.push(SIDECAR_SUFFIX);
    PathBuf::from(name)
}

async fn load_sidecar(path: &Path) -> Result<BTreeMap<String, Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(raw) => serde_json::from_slice(&raw)
            .map_err(|e| DumpError::backend(0, format!("corrupt metadata sidecar: {e}"))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(e) => Err(backend_err("failed to read metadata sidecar", e)),
    }
}

impl VirtualDisk for LocalDisk {
    fn info(&self) -> DiskInfo {
        self.info
    }

    async fn read_sectors(&mut self, sector_offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_range(sector_offset, buf.len())?;
        self.file
            .seek(SeekFrom::Start(sector_offset * SECTOR_SIZE))
            .await
            .map_err(|e| backend_err("seek failed", e))?;
        self.file
            .read_exact(buf)
            .await
            .map_err(|e| backend_err("read failed", e))?;
        Ok(())
    }

    async fn write_sectors(&mut self, sector_offset: u64, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(DumpError::backend(
                0,
                format!("handle for {} is read-only", self.path.display()),
            ));
        }
        self.check_range(sector_offset, buf.len())?;
        self.file
            .seek(SeekFrom::Start(sector_offset * SECTOR_SIZE))
            .await
            .map_err(|e| backend_err("seek failed", e))?;
        self.file
            .write_all(buf)
            .await
            .map_err(|e| backend_err("write failed", e))?;
        Ok(())
    }

    async fn query_allocated(
        &mut self,
        sector_offset: u64,
        sector_count: u64,
        _chunk_sectors: u64,
    ) -> Result<Vec<SectorRange>> {
        // A flat image is fully backed by storage.
        Ok(vec![SectorRange {
            offset: sector_offset,
            length: sector_count,
        }])
    }

    async fn metadata_keys(&mut self) -> Result<Vec<String>> {
        Ok(self.metadata.keys().cloned().collect())
    }

    async fn read_metadata(&mut self, key: &str) -> Result<Vec<u8>> {
        self.metadata
            .get(key)
            .cloned()
            .ok_or_else(|| DumpError::backend(0, format!("no such metadata key: {key}")))
    }

    async fn write_metadata(&mut self, key: &str, value: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(DumpError::backend(
                0,
                format!("handle for {} is read-only", self.path.display()),
            ));
        }
        self.metadata.insert(key.to_string(), value.to_vec());
        self.persist_metadata().await
    }

    async fn close(self) -> Result<()> {
        if !self.read_only {
            self.file
                .sync_all()
                .await
                .map_err(|e| backend_err("sync failed", e))?;
        }
        Ok(())
    }
}
