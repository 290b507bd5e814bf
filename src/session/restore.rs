//! Restore: replay a backup stream into a disk, and the stream-validating
//! show mode.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::backend::{AdapterType, Backend, CreateSpec, DiskInfo, VirtualDisk};
use crate::error::{DumpError, Result};
use crate::session::{finish_backend, no_handle, SessionOptions};
use crate::stream::pipeline::{RestoreJob, StreamReader};
use crate::stream::protocol::{read_cbt_header, read_disk_info, read_metadata_entry, DiskInfoRecord};
use crate::workfile::WorkFile;
use crate::SECTOR_SIZE;

/// Run a restore session against a connected backend, replaying the
/// backup stream from `input`.
pub async fn restore<B, R>(
    mut backend: B,
    work: &WorkFile,
    opts: &SessionOptions,
    input: R,
) -> Result<()>
where
    B: Backend,
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut session = RestoreSession::<B> {
        disk: None,
        absolute_start_offset: 0,
    };

    let result = session.run(&mut backend, work, opts, input).await;
    let closed = session.teardown().await;
    let finished = finish_backend(backend, work.conn.as_ref(), opts).await;

    match (result.and(closed), finished) {
        (Ok(()), Ok(())) => Ok(()),
        (Err(e), _) => Err(e),
        (Ok(()), Err(e)) => Err(e),
    }
}

struct RestoreSession<B: Backend> {
    disk: Option<B::Disk>,
    absolute_start_offset: u64,
}

impl<B: Backend> RestoreSession<B> {
    fn disk(&mut self) -> Result<&mut B::Disk> {
        self.disk.as_mut().ok_or_else(no_handle)
    }

    async fn run<R>(
        &mut self,
        backend: &mut B,
        work: &WorkFile,
        opts: &SessionOptions,
        mut input: R,
    ) -> Result<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        if opts.cleanup_before {
            B::cleanup_stale(work.conn.as_ref()).await?;
        }

        // The stream is judged before any write handle is opened.
        let record = read_disk_info(&mut input).await?;
        self.absolute_start_offset = record.absolute_start_offset;

        let target = opts
            .clone_disk_path
            .as_deref()
            .unwrap_or(&work.disk.disk_path);

        if opts.create_disk {
            backend
                .create(
                    target,
                    &CreateSpec {
                        capacity_sectors: record.phys_capacity,
                        disk_type: opts.disk_type,
                        adapter_type: AdapterType::BusLogic,
                    },
                )
                .await?;
        }

        let disk = backend.open(target, false).await?;
        if opts.check_size {
            validate_geometry(&record, &disk.info())?;
        }
        self.disk = Some(disk);

        while let Some(entry) = read_metadata_entry(&mut input).await? {
            tracing::debug!(key = %entry.key, value_len = entry.value.len(), "metadata entry");
            if opts.restore_metadata {
                self.disk()?.write_metadata(&entry.key, &entry.value).await?;
            }
        }

        if opts.pipelined {
            self.replay_pipelined(input, opts).await
        } else {
            self.replay_direct(input, opts).await
        }
    }

    async fn replay_direct<R>(&mut self, mut input: R, opts: &SessionOptions) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut buffer = vec![0u8; opts.buffer_len()];

        while let Some(header) = read_cbt_header(&mut input).await? {
            tracing::debug!(
                start = header.start_offset,
                length = header.length,
                "restoring interval"
            );

            let mut sector_offset =
                (self.absolute_start_offset + header.start_offset) / SECTOR_SIZE;
            let mut remaining = header.length;
            while remaining > 0 {
                let sectors = opts.sectors_per_call.min(remaining / SECTOR_SIZE);
                let len = (sectors * SECTOR_SIZE) as usize;

                input.read_exact(&mut buffer[..len]).await?;
                self.disk()?
                    .write_sectors(sector_offset, &buffer[..len])
                    .await?;

                sector_offset += sectors;
                remaining -= len as u64;
            }
        }

        Ok(())
    }

    async fn replay_pipelined<R>(&mut self, input: R, opts: &SessionOptions) -> Result<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let mut reader = StreamReader::spawn(input, opts.buffer_len());
        let mut sector_offset = 0u64;
        let mut failure: Option<DumpError> = None;

        while let Some(job) = reader.next().await {
            match job {
                RestoreJob::Interval(header) => {
                    tracing::debug!(
                        start = header.start_offset,
                        length = header.length,
                        "restoring interval"
                    );
                    sector_offset =
                        (self.absolute_start_offset + header.start_offset) / SECTOR_SIZE;
                }
                RestoreJob::Data { buf, len } => {
                    if failure.is_none() {
                        if let Err(e) = self.disk()?.write_sectors(sector_offset, &buf[..len]).await
                        {
                            // Keep draining so the producer can wind down,
                            // then report the first error.
                            failure = Some(e);
                        }
                        sector_offset += len as u64 / SECTOR_SIZE;
                    }
                    reader.recycle(buf);
                }
            }
        }

        match failure {
            Some(e) => {
                let _ = reader.finish().await;
                Err(e)
            }
            None => reader.finish().await,
        }
    }

    /// Release session resources. Safe to call more than once.
    async fn teardown(&mut self) -> Result<()> {
        if let Some(disk) = self.disk.take() {
            disk.close().await?;
        }
        Ok(())
    }
}

/// Geometry check before a restore: every checked dimension of the
/// incoming record must fit the target disk. BIOS dimensions the target
/// reports as zero are skipped; physical dimensions always count.
fn validate_geometry(record: &DiskInfoRecord, target: &DiskInfo) -> Result<()> {
    let checks = [
        (
            "BIOS cylinders",
            target.bios_geometry.cylinders,
            record.bios_cylinders,
            true,
        ),
        ("BIOS heads", target.bios_geometry.heads, record.bios_heads, true),
        (
            "BIOS sectors",
            target.bios_geometry.sectors,
            record.bios_sectors,
            true,
        ),
        (
            "physical cylinders",
            target.phys_geometry.cylinders,
            record.phys_cylinders,
            false,
        ),
        (
            "physical heads",
            target.phys_geometry.heads,
            record.phys_heads,
            false,
        ),
        (
            "physical sectors",
            target.phys_geometry.sectors,
            record.phys_sectors,
            false,
        ),
    ];

    for (name, have, want, skip_when_zero) in checks {
        if skip_when_zero && have == 0 {
            continue;
        }
        if have < want {
            return Err(DumpError::Geometry(format!(
                "target disk has {have} {name}, the stream was written from a disk with {want}"
            )));
        }
    }

    Ok(())
}

/// Show: run the restore record loop in validate-only mode. Every record
/// is read and framing is enforced, but no backend is opened and nothing
/// is written anywhere.
pub async fn show<R>(mut input: R, opts: &SessionOptions) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let record = read_disk_info(&mut input).await?;

    let mut metadata_entries = 0u64;
    while let Some(entry) = read_metadata_entry(&mut input).await? {
        tracing::debug!(key = %entry.key, value_len = entry.value.len(), "metadata entry");
        metadata_entries += 1;
    }

    let mut buffer = vec![0u8; opts.buffer_len()];
    let mut intervals = 0u64;
    let mut payload_bytes = 0u64;

    while let Some(header) = read_cbt_header(&mut input).await? {
        intervals += 1;
        let mut remaining = header.length;
        while remaining > 0 {
            let len = remaining.min(buffer.len() as u64) as usize;
            input.read_exact(&mut buffer[..len]).await?;
            remaining -= len as u64;
            payload_bytes += len as u64;
        }
    }

    tracing::info!(
        disk_length = record.absolute_disk_length,
        metadata_entries,
        intervals,
        payload_bytes,
        "stream validated"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Geometry;

    fn record_with_geometry(geometry: Geometry) -> DiskInfoRecord {
        DiskInfoRecord {
            bios_cylinders: geometry.cylinders,
            bios_heads: geometry.heads,
            bios_sectors: geometry.sectors,
            phys_cylinders: geometry.cylinders,
            phys_heads: geometry.heads,
            phys_sectors: geometry.sectors,
            ..Default::default()
        }
    }

    fn target_with_geometry(geometry: Geometry) -> DiskInfo {
        DiskInfo {
            capacity_sectors: 2048,
            bios_geometry: geometry,
            phys_geometry: geometry,
            adapter_type: AdapterType::BusLogic,
            logical_sector_size: 512,
            physical_sector_size: 512,
        }
    }

    #[test]
    fn test_geometry_equal_passes() {
        let geometry = Geometry {
            cylinders: 100,
            heads: 16,
            sectors: 63,
        };
        validate_geometry(&record_with_geometry(geometry), &target_with_geometry(geometry))
            .unwrap();
    }

    #[test]
    fn test_geometry_smaller_target_fails() {
        let record = record_with_geometry(Geometry {
            cylinders: 1000,
            heads: 16,
            sectors: 63,
        });
        let target = target_with_geometry(Geometry {
            cylinders: 500,
            heads: 16,
            sectors: 63,
        });

        let err = validate_geometry(&record, &target).unwrap_err();
        assert!(matches!(err, DumpError::Geometry(_)));
    }

    #[test]
    fn test_zero_bios_dimension_skipped() {
        let record = record_with_geometry(Geometry {
            cylinders: 100,
            heads: 16,
            sectors: 63,
        });
        let mut target = target_with_geometry(Geometry {
            cylinders: 100,
            heads: 16,
            sectors: 63,
        });
        // The target not reporting BIOS geometry is not a mismatch.
        target.bios_geometry = Geometry::default();

        validate_geometry(&record, &target).unwrap();
    }

    #[test]
    fn test_zero_phys_dimension_still_checked() {
        let record = record_with_geometry(Geometry {
            cylinders: 100,
            heads: 16,
            sectors: 63,
        });
        let mut target = target_with_geometry(Geometry {
            cylinders: 100,
            heads: 16,
            sectors: 63,
        });
        target.phys_geometry.cylinders = 0;

        let err = validate_geometry(&record, &target).unwrap_err();
        assert!(matches!(err, DumpError::Geometry(_)));
    }
}
