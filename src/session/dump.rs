//! Dump: save the changed, allocated sectors of a disk as a backup
//! stream on the output.

use bytes::Bytes;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWrite, AsyncWriteExt, SeekFrom};

use crate::backend::{
    AdapterType, Backend, CreateSpec, DiskInfo, SectorRange, VirtualDisk, MAX_CHUNKS_PER_QUERY,
    MIN_CHUNK_SECTORS,
};
use crate::error::{DumpError, Result};
use crate::extent::{Extent, Intersection};
use crate::session::{finish_backend, no_handle, SessionOptions};
use crate::stream::pipeline::CopyPipeline;
use crate::stream::protocol::{
    metadata_end_marker, CbtHeader, DiskInfoRecord, MetadataEntry, PROTOCOL_VERSION,
};
use crate::workfile::WorkFile;
use crate::SECTOR_SIZE;

/// Byte accounting of a completed dump.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DumpStats {
    /// Total bytes reported as changed by change tracking.
    pub changed_bytes: u64,
    /// Bytes both changed and allocated, i.e. selected for saving.
    pub saved_bytes: u64,
    /// Payload bytes actually written to the stream.
    pub payload_bytes: u64,
}

/// Run a dump session against a connected backend, writing the backup
/// stream to `output`.
pub async fn dump<B, W>(
    mut backend: B,
    work: &WorkFile,
    opts: &SessionOptions,
    output: W,
) -> Result<DumpStats>
where
    B: Backend,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let mut session = DumpSession::<B, W>::new(output);

    let result = session.run(&mut backend, work, opts).await;
    let closed = session.teardown().await;
    let finished = finish_backend(backend, work.conn.as_ref(), opts).await;

    // A failed enqueue only says the consumer stopped; teardown joined it
    // and knows why.
    let result = match (result, closed) {
        (Ok(stats), Ok(())) => Ok(stats),
        (Err(DumpError::Pipeline(_)), Err(real)) => Err(real),
        (Err(e), _) => Err(e),
        (Ok(_), Err(e)) => Err(e),
    };
    match (result, finished) {
        (Ok(stats), Ok(())) => Ok(stats),
        (Err(e), _) => Err(e),
        (Ok(_), Err(e)) => Err(e),
    }
}

struct DumpSession<B: Backend, W> {
    read_disk: Option<B::Disk>,
    clone_disk: Option<B::Disk>,
    raw_file: Option<File>,
    pipeline: Option<CopyPipeline<W>>,
    output: Option<W>,
    mirror_raw: bool,
    absolute_start_offset: u64,
    stats: DumpStats,
}

impl<B, W> DumpSession<B, W>
where
    B: Backend,
    W: AsyncWrite + Send + Unpin + 'static,
{
    fn new(output: W) -> Self {
        Self {
            read_disk: None,
            clone_disk: None,
            raw_file: None,
            pipeline: None,
            output: Some(output),
            mirror_raw: false,
            absolute_start_offset: 0,
            stats: DumpStats::default(),
        }
    }

    fn read_disk(&mut self) -> Result<&mut B::Disk> {
        self.read_disk.as_mut().ok_or_else(no_handle)
    }

    fn pipeline(&mut self) -> Result<&mut CopyPipeline<W>> {
        self.pipeline.as_mut().ok_or_else(no_handle)
    }

    fn output(&mut self) -> Result<&mut W> {
        self.output.as_mut().ok_or_else(no_handle)
    }

    async fn run(
        &mut self,
        backend: &mut B,
        work: &WorkFile,
        opts: &SessionOptions,
    ) -> Result<DumpStats> {
        if opts.cleanup_before {
            B::cleanup_stale(work.conn.as_ref()).await?;
        }

        let change_info = work.change_info.as_ref().ok_or_else(|| {
            DumpError::Config("work file has no DiskChangeInfo".to_string())
        })?;

        let read_disk = backend.open(&work.disk.disk_path, true).await?;
        let info = read_disk.info();
        self.read_disk = Some(read_disk);
        tracing::debug!(
            path = %work.disk.disk_path,
            capacity_sectors = info.capacity_sectors,
            "read handle opened"
        );

        if let Some(path) = &opts.raw_image_path {
            tracing::debug!(path = %path.display(), "opening raw image file");
            let raw = OpenOptions::new()
                .write(true)
                .truncate(true)
                .open(path)
                .await?;
            self.raw_file = Some(raw);
            self.mirror_raw = true;
        }

        if opts.pipelined {
            let writer = self.output.take().ok_or_else(no_handle)?;
            self.pipeline = Some(CopyPipeline::spawn(
                writer,
                self.raw_file.take(),
                opts.buffer_len(),
            ));
        }

        // Disk info goes first; its absolute start offset applies to
        // every changed-block offset that follows.
        let record = disk_info_record(&info, change_info.length, change_info.start_offset);
        self.absolute_start_offset = record.absolute_start_offset;
        self.emit_control(record.encode()).await?;

        if let Some(path) = &opts.clone_disk_path {
            if opts.create_disk {
                backend
                    .create(
                        path,
                        &CreateSpec {
                            capacity_sectors: change_info.length / SECTOR_SIZE,
                            disk_type: opts.disk_type,
                            adapter_type: AdapterType::BusLogic,
                        },
                    )
                    .await?;
            }
            self.clone_disk = Some(backend.open(path, false).await?);
        }

        self.save_metadata(opts).await?;

        let allocated = self.list_allocated(&info, opts).await?;
        let changed = change_info.changed_extents();
        self.stats.changed_bytes = changed.iter().map(|e| e.length).sum();

        let mut scratch = if opts.pipelined {
            Vec::new()
        } else {
            vec![0u8; opts.buffer_len()]
        };

        for overlap in Intersection::new(&changed, &allocated) {
            self.stats.saved_bytes += overlap.length;
            self.transfer_interval(overlap, opts, &mut scratch).await?;
        }

        tracing::debug!(
            changed_bytes = self.stats.changed_bytes,
            saved_bytes = self.stats.saved_bytes,
            "transfer complete"
        );

        if let Some(pipeline) = self.pipeline.take() {
            let (writer, raw) = pipeline.finish().await?;
            self.output = Some(writer);
            self.raw_file = raw;
        } else {
            self.output()?.flush().await?;
        }

        Ok(self.stats)
    }

    /// Emit record bytes onto the stream, through the pipeline when one
    /// is running so the sink keeps a single writer.
    async fn emit_control(&mut self, bytes: Bytes) -> Result<()> {
        if self.pipeline.is_some() {
            self.pipeline()?.write_control(bytes).await
        } else {
            self.output()?.write_all(&bytes).await?;
            Ok(())
        }
    }

    /// Save all metadata keys, mirroring them to the clone disk when one
    /// is open. The end sentinel is written even when metadata saving is
    /// disabled.
    async fn save_metadata(&mut self, opts: &SessionOptions) -> Result<()> {
        if opts.save_metadata {
            let keys = self.read_disk()?.metadata_keys().await?;
            for key in keys {
                tracing::debug!(key = %key, "saving metadata key");
                let value = self.read_disk()?.read_metadata(&key).await?;
                if let Some(clone) = self.clone_disk.as_mut() {
                    clone.write_metadata(&key, &value).await?;
                }
                let entry = MetadataEntry { key, value };
                self.emit_control(entry.encode()).await?;
            }
        }
        self.emit_control(metadata_end_marker()).await
    }

    /// Build the allocated-block list: batched queries bounded by
    /// [`MAX_CHUNKS_PER_QUERY`], with the unaligned tail of the disk
    /// appended as an extra block. With querying disabled the whole disk
    /// counts as allocated.
    async fn list_allocated(
        &mut self,
        info: &DiskInfo,
        opts: &SessionOptions,
    ) -> Result<Vec<Extent>> {
        let capacity = info.capacity_sectors;
        let mut blocks: Vec<SectorRange> = Vec::new();

        if opts.query_allocated {
            let mut chunk = opts.chunk_sectors;
            if chunk > capacity {
                chunk = capacity;
            }
            if chunk < MIN_CHUNK_SECTORS {
                chunk = MIN_CHUNK_SECTORS;
            }

            let mut num_chunks = capacity / chunk;
            tracing::debug!(chunk_sectors = chunk, num_chunks, "querying allocated blocks");

            let mut offset = 0u64;
            while num_chunks > 0 {
                let batch = num_chunks.min(MAX_CHUNKS_PER_QUERY);
                let ranges = self
                    .read_disk()?
                    .query_allocated(offset, batch * chunk, chunk)
                    .await?;
                blocks.extend(ranges);
                offset += batch * chunk;
                num_chunks -= batch;
            }

            let unaligned = capacity % chunk;
            if unaligned > 0 {
                tracing::debug!(unaligned_sectors = unaligned, "appending unaligned tail");
                blocks.push(SectorRange {
                    offset,
                    length: unaligned,
                });
            }

            tracing::debug!(
                allocated_sectors = blocks.iter().map(|b| b.length).sum::<u64>(),
                blocks = blocks.len(),
                "allocated block query complete"
            );
        } else {
            blocks.push(SectorRange {
                offset: 0,
                length: capacity,
            });
        }

        Ok(blocks.into_iter().map(SectorRange::to_byte_extent).collect())
    }

    async fn transfer_interval(
        &mut self,
        extent: Extent,
        opts: &SessionOptions,
        scratch: &mut [u8],
    ) -> Result<()> {
        tracing::debug!(
            start = extent.start,
            length = extent.length,
            sectors = extent.length / SECTOR_SIZE,
            "saving interval"
        );

        let header = CbtHeader {
            start_offset: extent.start,
            length: extent.length,
        };

        if self.pipeline.is_some() {
            self.transfer_pipelined(header, extent, opts).await
        } else {
            self.transfer_direct(header, extent, opts, scratch).await
        }
    }

    async fn transfer_pipelined(
        &mut self,
        header: CbtHeader,
        extent: Extent,
        opts: &SessionOptions,
    ) -> Result<()> {
        self.pipeline()?.write_control(header.encode()).await?;
        if self.mirror_raw {
            self.pipeline()?.seek_raw(extent.start).await?;
        }

        let mut sector_offset = (self.absolute_start_offset + extent.start) / SECTOR_SIZE;
        let mut remaining = extent.length;
        while remaining > 0 {
            let sectors = opts.sectors_per_call.min(remaining / SECTOR_SIZE);
            let len = (sectors * SECTOR_SIZE) as usize;

            let mut buf = self.pipeline()?.buffer().await;
            self.read_disk()?
                .read_sectors(sector_offset, &mut buf[..len])
                .await?;
            if let Some(clone) = self.clone_disk.as_mut() {
                clone.write_sectors(sector_offset, &buf[..len]).await?;
            }
            self.pipeline()?.send(buf, len).await?;

            self.stats.payload_bytes += len as u64;
            sector_offset += sectors;
            remaining -= len as u64;
        }

        // Wait for the writer before any further record is produced.
        self.pipeline()?.flush().await
    }

    async fn transfer_direct(
        &mut self,
        header: CbtHeader,
        extent: Extent,
        opts: &SessionOptions,
        scratch: &mut [u8],
    ) -> Result<()> {
        self.output()?.write_all(&header.encode()).await?;
        if let Some(raw) = self.raw_file.as_mut() {
            raw.seek(SeekFrom::Start(extent.start)).await?;
        }

        let mut sector_offset = (self.absolute_start_offset + extent.start) / SECTOR_SIZE;
        let mut remaining = extent.length;
        while remaining > 0 {
            let sectors = opts.sectors_per_call.min(remaining / SECTOR_SIZE);
            let len = (sectors * SECTOR_SIZE) as usize;

            self.read_disk()?
                .read_sectors(sector_offset, &mut scratch[..len])
                .await?;
            if let Some(clone) = self.clone_disk.as_mut() {
                clone.write_sectors(sector_offset, &scratch[..len]).await?;
            }
            self.output()?.write_all(&scratch[..len]).await?;
            if let Some(raw) = self.raw_file.as_mut() {
                raw.write_all(&scratch[..len]).await?;
            }

            self.stats.payload_bytes += len as u64;
            sector_offset += sectors;
            remaining -= len as u64;
        }

        Ok(())
    }

    /// Release session resources in reverse acquisition order. Safe to
    /// call more than once.
    async fn teardown(&mut self) -> Result<()> {
        let mut first: Option<DumpError> = None;

        if let Some(pipeline) = self.pipeline.take() {
            if let Err(e) = pipeline.finish().await {
                first.get_or_insert(e);
            }
        }
        if let Some(disk) = self.clone_disk.take() {
            if let Err(e) = disk.close().await {
                first.get_or_insert(e);
            }
        }
        if let Some(disk) = self.read_disk.take() {
            if let Err(e) = disk.close().await {
                first.get_or_insert(e);
            }
        }
        if self.raw_file.take().is_some() {
            tracing::debug!("closing raw image file");
        }
        self.output.take();

        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn disk_info_record(
    info: &DiskInfo,
    absolute_disk_length: u64,
    absolute_start_offset: u64,
) -> DiskInfoRecord {
    // BIOS geometry falls back to the physical one dimension by
    // dimension when the backend reports zeroes.
    let bios = info.bios_geometry;
    let phys = info.phys_geometry;

    DiskInfoRecord {
        protocol_version: PROTOCOL_VERSION,
        absolute_disk_length,
        absolute_start_offset,
        bios_cylinders: if bios.cylinders > 0 { bios.cylinders } else { phys.cylinders },
        bios_heads: if bios.heads > 0 { bios.heads } else { phys.heads },
        bios_sectors: if bios.sectors > 0 { bios.sectors } else { phys.sectors },
        phys_cylinders: phys.cylinders,
        phys_heads: phys.heads,
        phys_sectors: phys.sectors,
        phys_capacity: info.capacity_sectors,
        adapter_type: info.adapter_type as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{MemoryBackend, MemoryDisk};
    use crate::backend::Geometry;

    #[test]
    fn test_disk_info_record_bios_fallback() {
        let info = DiskInfo {
            capacity_sectors: 2048,
            bios_geometry: Geometry {
                cylinders: 0,
                heads: 0,
                sectors: 0,
            },
            phys_geometry: Geometry {
                cylinders: 2,
                heads: 16,
                sectors: 63,
            },
            adapter_type: AdapterType::BusLogic,
            logical_sector_size: 512,
            physical_sector_size: 512,
        };

        let record = disk_info_record(&info, 2048 * 512, 0);
        assert_eq!(record.bios_cylinders, 2);
        assert_eq!(record.bios_heads, 16);
        assert_eq!(record.bios_sectors, 63);
        assert_eq!(record.phys_capacity, 2048);
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let backend = MemoryBackend::new();
        backend.add_disk("disk0", MemoryDisk::new(16));

        let mut session: DumpSession<MemoryBackend, Vec<u8>> = DumpSession::new(Vec::new());
        let mut b = backend.clone();
        session.read_disk = Some(b.open("disk0", true).await.unwrap());

        session.teardown().await.unwrap();
        assert!(session.read_disk.is_none());
        assert!(session.output.is_none());

        // Second teardown finds everything released already.
        session.teardown().await.unwrap();
    }
}
