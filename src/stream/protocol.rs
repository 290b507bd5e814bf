//! On-wire records of the backup stream.
//!
//! A dump stream is one disk-info record, zero or more metadata records
//! closed by an end sentinel, then zero or more changed-block records.
//! Every record starts and ends with the protocol magic word; the two
//! markers are the primary framing check and the codec never resyncs
//! after a mismatch.
//!
//! All multi-byte integers are host-endian: the stream is only valid on
//! the architecture that wrote it and is not portable.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{DumpError, Result};
use crate::SECTOR_SIZE;

/// Magic word bracketing every record.
pub const STREAM_MAGIC: u32 = 0x12122012;

/// Stream protocol version carried in the disk-info record.
pub const PROTOCOL_VERSION: u32 = 1;

/// Encoded size of a disk-info record.
pub const DISK_INFO_LEN: usize = 128;

/// Encoded size of a metadata record header.
pub const METADATA_HEADER_LEN: usize = 16;

/// Encoded size of a changed-block record header.
pub const CBT_HEADER_LEN: usize = 32;

/// Sanity cap for metadata key and value lengths; prevents OOM on a
/// corrupted stream before the magic check of the next record would
/// catch it.
pub const MAX_METADATA_LEN: u32 = 16 * 1024 * 1024;

fn check_magic(record: &str, marker: &str, found: u32) -> Result<()> {
    if found != STREAM_MAGIC {
        return Err(DumpError::Framing(format!(
            "{record}: bad {marker} magic {found:#010x}, expected {STREAM_MAGIC:#010x}"
        )));
    }
    Ok(())
}

/// Read exactly `len` header bytes; truncation at header level is a
/// framing error, not an I/O error.
async fn read_header<R: AsyncRead + Unpin>(
    r: &mut R,
    len: usize,
    record: &str,
) -> Result<BytesMut> {
    let mut buf = BytesMut::zeroed(len);
    r.read_exact(&mut buf).await.map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => {
            DumpError::Framing(format!("{record}: truncated header"))
        }
        _ => DumpError::Io(e),
    })?;
    Ok(buf)
}

// =============================================================================
// Disk-info record
// =============================================================================

/// Fixed-width description of the dumped disk, padded to 128 bytes.
///
/// Geometry and capacity come from the backend; the absolute length and
/// start offset come from the snapshot's change-tracking info. The
/// absolute start offset is added to every changed-block offset when
/// addressing the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiskInfoRecord {
    pub protocol_version: u32,
    pub absolute_disk_length: u64,
    pub absolute_start_offset: u64,
    pub bios_cylinders: u32,
    pub bios_heads: u32,
    pub bios_sectors: u32,
    pub phys_cylinders: u32,
    pub phys_heads: u32,
    pub phys_sectors: u32,
    /// Physical capacity in sectors.
    pub phys_capacity: u64,
    pub adapter_type: u32,
}

impl DiskInfoRecord {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(DISK_INFO_LEN);
        buf.put_u32_ne(STREAM_MAGIC);
        buf.put_u32_ne(self.protocol_version);
        buf.put_u64_ne(self.absolute_disk_length);
        buf.put_u64_ne(self.absolute_start_offset);
        buf.put_u32_ne(self.bios_cylinders);
        buf.put_u32_ne(self.bios_heads);
        buf.put_u32_ne(self.bios_sectors);
        buf.put_u32_ne(self.phys_cylinders);
        buf.put_u32_ne(self.phys_heads);
        buf.put_u32_ne(self.phys_sectors);
        buf.put_u64_ne(self.phys_capacity);
        buf.put_u32_ne(self.adapter_type);
        buf.put_bytes(0, 16 * 4);
        buf.put_u32_ne(STREAM_MAGIC);
        debug_assert_eq!(buf.len(), DISK_INFO_LEN);
        buf.freeze()
    }

    pub fn decode(mut payload: impl Buf) -> Result<Self> {
        if payload.remaining() < DISK_INFO_LEN {
            return Err(DumpError::Framing("disk info: record too short".into()));
        }

        check_magic("disk info", "start", payload.get_u32_ne())?;
        let record = Self {
            protocol_version: payload.get_u32_ne(),
            absolute_disk_length: payload.get_u64_ne(),
            absolute_start_offset: payload.get_u64_ne(),
            bios_cylinders: payload.get_u32_ne(),
            bios_heads: payload.get_u32_ne(),
            bios_sectors: payload.get_u32_ne(),
            phys_cylinders: payload.get_u32_ne(),
            phys_heads: payload.get_u32_ne(),
            phys_sectors: payload.get_u32_ne(),
            phys_capacity: payload.get_u64_ne(),
            adapter_type: payload.get_u32_ne(),
        };
        payload.advance(16 * 4);
        check_magic("disk info", "end", payload.get_u32_ne())?;

        if record.absolute_start_offset % SECTOR_SIZE != 0 {
            return Err(DumpError::Framing(format!(
                "disk info: absolute start offset {} is not sector aligned",
                record.absolute_start_offset
            )));
        }

        Ok(record)
    }
}

pub async fn write_disk_info<W: AsyncWrite + Unpin>(
    w: &mut W,
    info: &DiskInfoRecord,
) -> Result<()> {
    w.write_all(&info.encode()).await?;
    Ok(())
}

pub async fn read_disk_info<R: AsyncRead + Unpin>(r: &mut R) -> Result<DiskInfoRecord> {
    let buf = read_header(r, DISK_INFO_LEN, "disk info").await?;
    let record = DiskInfoRecord::decode(buf.freeze())?;

    if record.protocol_version != PROTOCOL_VERSION {
        tracing::warn!(
            version = record.protocol_version,
            expected = PROTOCOL_VERSION,
            "stream was written by a different protocol version"
        );
    }

    let bios = format!(
        "{}/{}/{}",
        record.bios_cylinders, record.bios_heads, record.bios_sectors
    );
    let phys = format!(
        "{}/{}/{}",
        record.phys_cylinders, record.phys_heads, record.phys_sectors
    );
    tracing::debug!(
        version = record.protocol_version,
        absolute_disk_length = record.absolute_disk_length,
        absolute_start_offset = record.absolute_start_offset,
        bios_geometry = %bios,
        phys_geometry = %phys,
        phys_capacity = record.phys_capacity,
        adapter_type = record.adapter_type,
        "disk info"
    );

    Ok(record)
}

// =============================================================================
// Metadata records
// =============================================================================

/// One metadata key/value pair of the dumped disk.
///
/// On the wire the key is written NUL-terminated and its length field
/// counts the terminator; the value is opaque bytes. A header with both
/// lengths zero is the end-of-metadata sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataEntry {
    pub key: String,
    pub value: Vec<u8>,
}

impl MetadataEntry {
    pub fn encode(&self) -> Bytes {
        let key_len = self.key.len() + 1;
        let mut buf =
            BytesMut::with_capacity(METADATA_HEADER_LEN + key_len + self.value.len());
        buf.put_u32_ne(STREAM_MAGIC);
        buf.put_u32_ne(key_len as u32);
        buf.put_u32_ne(self.value.len() as u32);
        buf.put_u32_ne(STREAM_MAGIC);
        buf.put_slice(self.key.as_bytes());
        buf.put_u8(0);
        buf.put_slice(&self.value);
        buf.freeze()
    }
}

pub async fn write_metadata_entry<W: AsyncWrite + Unpin>(
    w: &mut W,
    entry: &MetadataEntry,
) -> Result<()> {
    w.write_all(&entry.encode()).await?;
    Ok(())
}

/// Encoded end-of-metadata sentinel: a header with both lengths zero.
pub fn metadata_end_marker() -> Bytes {
    let mut buf = BytesMut::with_capacity(METADATA_HEADER_LEN);
    buf.put_u32_ne(STREAM_MAGIC);
    buf.put_u32_ne(0);
    buf.put_u32_ne(0);
    buf.put_u32_ne(STREAM_MAGIC);
    buf.freeze()
}

pub async fn write_metadata_end<W: AsyncWrite + Unpin>(w: &mut W) -> Result<()> {
    w.write_all(&metadata_end_marker()).await?;
    Ok(())
}

/// Read one metadata record; `None` when the end sentinel was read.
pub async fn read_metadata_entry<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<Option<MetadataEntry>> {
    let mut header = read_header(r, METADATA_HEADER_LEN, "metadata").await?;

    check_magic("metadata", "start", header.get_u32_ne())?;
    let key_len = header.get_u32_ne();
    let data_len = header.get_u32_ne();
    check_magic("metadata", "end", header.get_u32_ne())?;

    if key_len == 0 && data_len == 0 {
        return Ok(None);
    }
    if key_len == 0 {
        return Err(DumpError::Framing(
            "metadata: zero key length with non-empty value".into(),
        ));
    }
    if key_len > MAX_METADATA_LEN || data_len > MAX_METADATA_LEN {
        return Err(DumpError::Framing(format!(
            "metadata: length out of range (key {key_len}, value {data_len})"
        )));
    }

    let mut key_bytes = vec![0u8; key_len as usize];
    r.read_exact(&mut key_bytes).await.map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => DumpError::Framing("metadata: truncated key".into()),
        _ => DumpError::Io(e),
    })?;
    if key_bytes.pop() != Some(0) {
        return Err(DumpError::Framing(
            "metadata: key is not NUL terminated".into(),
        ));
    }
    let key = String::from_utf8(key_bytes)
        .map_err(|_| DumpError::Framing("metadata: key is not valid UTF-8".into()))?;

    let mut value = vec![0u8; data_len as usize];
    r.read_exact(&mut value).await.map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => DumpError::Framing("metadata: truncated value".into()),
        _ => DumpError::Io(e),
    })?;

    Ok(Some(MetadataEntry { key, value }))
}

// =============================================================================
// Changed-block records
// =============================================================================

/// Header of one changed-block payload: `length` bytes of raw sector data
/// follow immediately.
///
/// The start offset is relative to the stream's absolute start offset.
/// The header occupies 32 bytes on the wire, with four reserved bytes
/// after each magic word keeping the 64-bit fields naturally aligned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CbtHeader {
    pub start_offset: u64,
    pub length: u64,
}

impl CbtHeader {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(CBT_HEADER_LEN);
        buf.put_u32_ne(STREAM_MAGIC);
        buf.put_bytes(0, 4);
        buf.put_u64_ne(self.start_offset);
        buf.put_u64_ne(self.length);
        buf.put_u32_ne(STREAM_MAGIC);
        buf.put_bytes(0, 4);
        debug_assert_eq!(buf.len(), CBT_HEADER_LEN);
        buf.freeze()
    }

    pub fn decode(mut payload: impl Buf) -> Result<Self> {
        if payload.remaining() < CBT_HEADER_LEN {
            return Err(DumpError::Framing(
                "changed-block header: record too short".into(),
            ));
        }

        check_magic("changed-block header", "start", payload.get_u32_ne())?;
        payload.advance(4);
        let header = Self {
            start_offset: payload.get_u64_ne(),
            length: payload.get_u64_ne(),
        };
        check_magic("changed-block header", "end", payload.get_u32_ne())?;

        if header.start_offset % SECTOR_SIZE != 0 {
            return Err(DumpError::Framing(format!(
                "changed-block header: start offset {} is not sector aligned",
                header.start_offset
            )));
        }
        if header.length == 0 || header.length % SECTOR_SIZE != 0 {
            return Err(DumpError::Framing(format!(
                "changed-block header: payload length {} is not a positive multiple of the sector size",
                header.length
            )));
        }

        Ok(header)
    }
}

pub async fn write_cbt_header<W: AsyncWrite + Unpin>(
    w: &mut W,
    header: &CbtHeader,
) -> Result<()> {
    w.write_all(&header.encode()).await?;
    Ok(())
}

/// Read one changed-block header.
///
/// Returns `None` on a clean end of stream at a record boundary. A
/// partial header is a framing error; running out of input inside the
/// payload that follows is the caller's I/O error.
pub async fn read_cbt_header<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<CbtHeader>> {
    let mut buf = [0u8; CBT_HEADER_LEN];
    let mut filled = 0;
    while filled < CBT_HEADER_LEN {
        let n = r.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    if filled == 0 {
        return Ok(None);
    }
    if filled < CBT_HEADER_LEN {
        return Err(DumpError::Framing(
            "changed-block header: truncated at end of stream".into(),
        ));
    }

    CbtHeader::decode(&buf[..]).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disk_info_roundtrip() {
        let info = DiskInfoRecord {
            protocol_version: PROTOCOL_VERSION,
            absolute_disk_length: 64 * 1024 * 1024,
            absolute_start_offset: 0,
            bios_cylinders: 130,
            bios_heads: 16,
            bios_sectors: 63,
            phys_cylinders: 130,
            phys_heads: 16,
            phys_sectors: 63,
            phys_capacity: 131072,
            adapter_type: 2,
        };

        let encoded = info.encode();
        assert_eq!(encoded.len(), DISK_INFO_LEN);

        let decoded = DiskInfoRecord::decode(encoded).unwrap();
        assert_eq!(decoded, info);
    }

    #[test]
    fn test_disk_info_magic_mutation_detected() {
        let info = DiskInfoRecord {
            protocol_version: PROTOCOL_VERSION,
            phys_capacity: 2048,
            ..Default::default()
        };
        let encoded = info.encode();

        // Flip one byte in each magic word.
        for index in [0, DISK_INFO_LEN - 4] {
            let mut corrupted = encoded.to_vec();
            corrupted[index] ^= 0xff;
            let err = DiskInfoRecord::decode(&corrupted[..]).unwrap_err();
            assert!(matches!(err, DumpError::Framing(_)), "index {index}: {err}");
        }
    }

    #[tokio::test]
    async fn test_disk_info_short_read_is_framing_error() {
        let info = DiskInfoRecord::default();
        let encoded = info.encode();

        let mut input = &encoded[..DISK_INFO_LEN - 10];
        let err = read_disk_info(&mut input).await.unwrap_err();
        assert!(matches!(err, DumpError::Framing(_)));
    }

    #[tokio::test]
    async fn test_metadata_roundtrip() {
        let entries = vec![
            MetadataEntry {
                key: "adapterType".to_string(),
                value: b"buslogic".to_vec(),
            },
            MetadataEntry {
                key: "geometry.cylinders".to_string(),
                value: b"130".to_vec(),
            },
        ];

        let mut stream = Vec::new();
        for entry in &entries {
            write_metadata_entry(&mut stream, entry).await.unwrap();
        }
        write_metadata_end(&mut stream).await.unwrap();

        let mut input = &stream[..];
        for entry in &entries {
            let read = read_metadata_entry(&mut input).await.unwrap().unwrap();
            assert_eq!(&read, entry);
        }
        assert!(read_metadata_entry(&mut input).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_metadata_truncated_value() {
        let entry = MetadataEntry {
            key: "k".to_string(),
            value: vec![1, 2, 3, 4],
        };
        let encoded = entry.encode();

        let mut input = &encoded[..encoded.len() - 2];
        let err = read_metadata_entry(&mut input).await.unwrap_err();
        assert!(matches!(err, DumpError::Framing(_)));
    }

    #[tokio::test]
    async fn test_metadata_length_cap() {
        let mut stream = Vec::new();
        let mut header = BytesMut::new();
        header.put_u32_ne(STREAM_MAGIC);
        header.put_u32_ne(MAX_METADATA_LEN + 1);
        header.put_u32_ne(0);
        header.put_u32_ne(STREAM_MAGIC);
        stream.extend_from_slice(&header);

        let mut input = &stream[..];
        let err = read_metadata_entry(&mut input).await.unwrap_err();
        assert!(matches!(err, DumpError::Framing(_)));
    }

    #[tokio::test]
    async fn test_cbt_header_roundtrip() {
        let header = CbtHeader {
            start_offset: 4096,
            length: 512 * 32,
        };
        let encoded = header.encode();
        assert_eq!(encoded.len(), CBT_HEADER_LEN);

        let mut input = &encoded[..];
        let read = read_cbt_header(&mut input).await.unwrap().unwrap();
        assert_eq!(read, header);
    }

    #[tokio::test]
    async fn test_cbt_header_clean_eof() {
        let mut input: &[u8] = &[];
        assert!(read_cbt_header(&mut input).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cbt_header_partial_is_framing_error() {
        let header = CbtHeader {
            start_offset: 0,
            length: 512,
        };
        let encoded = header.encode();

        let mut input = &encoded[..CBT_HEADER_LEN / 2];
        let err = read_cbt_header(&mut input).await.unwrap_err();
        assert!(matches!(err, DumpError::Framing(_)));
    }

    #[test]
    fn test_cbt_header_rejects_unaligned_length() {
        let mut buf = BytesMut::new();
        buf.put_u32_ne(STREAM_MAGIC);
        buf.put_bytes(0, 4);
        buf.put_u64_ne(0);
        buf.put_u64_ne(100);
        buf.put_u32_ne(STREAM_MAGIC);
        buf.put_bytes(0, 4);

        let err = CbtHeader::decode(buf.freeze()).unwrap_err();
        assert!(matches!(err, DumpError::Framing(_)));
    }

    #[test]
    fn test_cbt_header_magic_mutation_detected() {
        let encoded = CbtHeader {
            start_offset: 512,
            length: 512,
        }
        .encode();

        for index in [0, 24] {
            let mut corrupted = encoded.to_vec();
            corrupted[index] ^= 0x01;
            let err = CbtHeader::decode(&corrupted[..]).unwrap_err();
            assert!(matches!(err, DumpError::Framing(_)), "index {index}: {err}");
        }
    }
}
