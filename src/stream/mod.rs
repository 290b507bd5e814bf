//! The backup stream: on-wire records plus the optional copy pipeline.
//!
//! ```text
//! dump stream layout:
//! +-----------+------------+-----+----------+------------+---------+-----+
//! | disk info | metadata 0 | ... | sentinel | cbt header | payload | ... |
//! +-----------+------------+-----+----------+------------+---------+-----+
//! ```
//!
//! End of stream is a clean EOF after the last payload.

pub mod pipeline;
pub mod protocol;

pub use pipeline::{CopyPipeline, RestoreJob, StreamReader, PIPELINE_DEPTH};
pub use protocol::{
    metadata_end_marker, read_cbt_header, read_disk_info, read_metadata_entry, write_cbt_header,
    write_disk_info, write_metadata_end, write_metadata_entry, CbtHeader, DiskInfoRecord,
    MetadataEntry, CBT_HEADER_LEN, DISK_INFO_LEN, MAX_METADATA_LEN, METADATA_HEADER_LEN,
    PROTOCOL_VERSION, STREAM_MAGIC,
};
