//! JSON work-file descriptor handed over by the backup orchestrator.
//!
//! The work file carries everything one invocation needs: how to reach the
//! vSphere endpoint, which disk to operate on, and, for dumps, the
//! changed-block information of the snapshot being saved.

use std::path::Path;

use serde::Deserialize;

use crate::error::{DumpError, Result};
use crate::extent::{is_sorted_disjoint, Extent};
use crate::SECTOR_SIZE;

#[derive(Debug, Clone, Deserialize)]
pub struct WorkFile {
    /// Remote session parameters; absent when operating on a local image.
    #[serde(rename = "ConnParams", default)]
    pub conn: Option<ConnParams>,

    #[serde(rename = "DiskParams")]
    pub disk: DiskParams,

    /// Change-tracking info of the snapshot; required for dump only.
    #[serde(rename = "DiskChangeInfo", default)]
    pub change_info: Option<DiskChangeInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnParams {
    #[serde(rename = "VmMoRef")]
    pub vm_moref: String,

    #[serde(rename = "VsphereHostName")]
    pub host: String,

    #[serde(rename = "VsphereThumbPrint", default)]
    pub thumbprint: Option<String>,

    #[serde(rename = "VsphereUsername")]
    pub username: String,

    #[serde(rename = "VspherePassword")]
    pub password: String,

    #[serde(rename = "VsphereSnapshotMoRef", default)]
    pub snapshot_moref: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiskParams {
    #[serde(rename = "diskPath")]
    pub disk_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiskChangeInfo {
    /// Disk length in bytes.
    pub length: u64,

    /// Base offset added to every changed-area offset when addressing the
    /// backend; recorded in the stream's disk-info record.
    #[serde(rename = "startOffset")]
    pub start_offset: u64,

    /// Changed byte ranges, sorted and disjoint.
    #[serde(rename = "changedArea")]
    pub changed_area: Vec<ChangedArea>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ChangedArea {
    pub start: u64,
    pub length: u64,
}

impl WorkFile {
    /// Load and validate a work file.
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read(path).await.map_err(|e| {
            DumpError::Config(format!("failed to read work file {}: {e}", path.display()))
        })?;

        let work: WorkFile = serde_json::from_slice(&raw).map_err(|e| {
            DumpError::Config(format!("failed to parse work file {}: {e}", path.display()))
        })?;

        work.validate()?;
        Ok(work)
    }

    fn validate(&self) -> Result<()> {
        if let Some(info) = &self.change_info {
            info.validate()?;
        }
        Ok(())
    }
}

impl DiskChangeInfo {
    fn validate(&self) -> Result<()> {
        if self.length % SECTOR_SIZE != 0 {
            return Err(DumpError::Config(format!(
                "DiskChangeInfo length {} is not a multiple of the sector size",
                self.length
            )));
        }
        if self.start_offset % SECTOR_SIZE != 0 {
            return Err(DumpError::Config(format!(
                "DiskChangeInfo startOffset {} is not a multiple of the sector size",
                self.start_offset
            )));
        }

        for area in &self.changed_area {
            if area.length == 0 {
                return Err(DumpError::Config(format!(
                    "changedArea entry at {} has zero length",
                    area.start
                )));
            }
            if area.start % SECTOR_SIZE != 0 || area.length % SECTOR_SIZE != 0 {
                return Err(DumpError::Config(format!(
                    "changedArea entry {{ start: {}, length: {} }} is not sector aligned",
                    area.start, area.length
                )));
            }
        }

        let extents = self.changed_extents();
        if !is_sorted_disjoint(&extents) {
            return Err(DumpError::Config(
                "changedArea entries are not sorted and disjoint".to_string(),
            ));
        }

        Ok(())
    }

    /// Changed areas as byte extents, in stream order.
    pub fn changed_extents(&self) -> Vec<Extent> {
        self.changed_area
            .iter()
            .map(|a| Extent::new(a.start, a.length))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Result<WorkFile> {
        let work: WorkFile =
            serde_json::from_str(json).map_err(|e| DumpError::Config(e.to_string()))?;
        work.validate()?;
        Ok(work)
    }

    #[test]
    fn test_parse_full_work_file() {
        let work = parse(
            r#"{
                "ConnParams": {
                    "VmMoRef": "moref=vm-1234",
                    "VsphereHostName": "vcenter.example.com",
                    "VsphereThumbPrint": "AA:BB:CC",
                    "VsphereUsername": "backup",
                    "VspherePassword": "secret",
                    "VsphereSnapshotMoRef": "snapshot-99"
                },
                "DiskParams": { "diskPath": "[datastore1] vm/vm.vmdk" },
                "DiskChangeInfo": {
                    "length": 1048576,
                    "startOffset": 0,
                    "changedArea": [
                        { "start": 0, "length": 65536 },
                        { "start": 131072, "length": 512 }
                    ]
                }
            }"#,
        )
        .unwrap();

        let conn = work.conn.unwrap();
        assert_eq!(conn.vm_moref, "moref=vm-1234");
        assert_eq!(conn.snapshot_moref.as_deref(), Some("snapshot-99"));
        assert_eq!(work.disk.disk_path, "[datastore1] vm/vm.vmdk");

        let info = work.change_info.unwrap();
        assert_eq!(info.length, 1048576);
        assert_eq!(
            info.changed_extents(),
            vec![Extent::new(0, 65536), Extent::new(131072, 512)]
        );
    }

    #[test]
    fn test_conn_params_optional_for_local_images() {
        let work = parse(r#"{ "DiskParams": { "diskPath": "/tmp/disk.img" } }"#).unwrap();
        assert!(work.conn.is_none());
        assert!(work.change_info.is_none());
    }

    #[test]
    fn test_missing_disk_params_rejected() {
        let err = parse(r#"{ "DiskChangeInfo": { "length": 0, "startOffset": 0, "changedArea": [] } }"#)
            .unwrap_err();
        assert!(matches!(err, DumpError::Config(_)));
    }

    #[test]
    fn test_unaligned_changed_area_rejected() {
        let err = parse(
            r#"{
                "DiskParams": { "diskPath": "/tmp/disk.img" },
                "DiskChangeInfo": {
                    "length": 1048576,
                    "startOffset": 0,
                    "changedArea": [ { "start": 100, "length": 512 } ]
                }
            }"#,
        )
        .unwrap_err();
        assert!(matches!(err, DumpError::Config(_)));
    }

    #[test]
    fn test_unsorted_changed_area_rejected() {
        let err = parse(
            r#"{
                "DiskParams": { "diskPath": "/tmp/disk.img" },
                "DiskChangeInfo": {
                    "length": 1048576,
                    "startOffset": 0,
                    "changedArea": [
                        { "start": 65536, "length": 512 },
                        { "start": 0, "length": 512 }
                    ]
                }
            }"#,
        )
        .unwrap_err();
        assert!(matches!(err, DumpError::Config(_)));
    }
}
