//! Copy pipeline: overlap backend I/O with stream I/O.
//!
//! One bounded FIFO of jobs connects exactly one producer and one
//! consumer; a pool of reusable buffers travels the other way on a
//! return channel. Order is strictly preserved: the consumer processes
//! jobs in enqueue order, so the stream (dump) or the backend (restore)
//! sees the exact sequence the producer emitted.
//!
//! On dump the session produces (backend reads) and a spawned task
//! consumes (stream and raw-mirror writes). On restore a spawned task
//! produces (stream reads) and the session consumes (backend writes).

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt, SeekFrom};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{DumpError, Result};
use crate::stream::protocol::{read_cbt_header, CbtHeader};

/// Depth of the job queue, and the number of pooled transfer buffers.
pub const PIPELINE_DEPTH: usize = 4;

enum Job {
    /// Raw record bytes for the stream only: disk info, metadata, and
    /// changed-block headers.
    Control(Bytes),
    /// Position the raw mirror at the start of a saved interval.
    RawSeek(u64),
    /// One chunk of sector data for the stream and the raw mirror.
    Data { buf: Vec<u8>, len: usize },
    /// Acknowledged once every prior job has been fully written.
    Flush(oneshot::Sender<()>),
}

fn consumer_stopped() -> DumpError {
    DumpError::Pipeline("stream writer stopped".into())
}

/// Dump-side pipeline: the consumer task owns the output stream and the
/// optional raw clone file.
pub struct CopyPipeline<W> {
    jobs: mpsc::Sender<Job>,
    returned: mpsc::Receiver<Vec<u8>>,
    free: Vec<Vec<u8>>,
    buffer_len: usize,
    consumer: JoinHandle<Result<(W, Option<File>)>>,
}

impl<W: AsyncWrite + Send + Unpin + 'static> CopyPipeline<W> {
    pub fn spawn(mut writer: W, mut raw: Option<File>, buffer_len: usize) -> Self {
        let (job_tx, mut job_rx) = mpsc::channel::<Job>(PIPELINE_DEPTH);
        let (return_tx, return_rx) = mpsc::channel::<Vec<u8>>(PIPELINE_DEPTH);

        let consumer = tokio::spawn(async move {
            while let Some(job) = job_rx.recv().await {
                match job {
                    Job::Control(bytes) => {
                        writer.write_all(&bytes).await?;
                    }
                    Job::RawSeek(offset) => {
                        if let Some(raw) = raw.as_mut() {
                            raw.seek(SeekFrom::Start(offset)).await?;
                        }
                    }
                    Job::Data { buf, len } => {
                        writer.write_all(&buf[..len]).await?;
                        if let Some(raw) = raw.as_mut() {
                            raw.write_all(&buf[..len]).await?;
                        }
                        // Producer may already be gone on teardown.
                        let _ = return_tx.send(buf).await;
                    }
                    Job::Flush(ack) => {
                        writer.flush().await?;
                        let _ = ack.send(());
                    }
                }
            }
            writer.flush().await?;
            Ok((writer, raw))
        });

        Self {
            jobs: job_tx,
            returned: return_rx,
            free: (0..PIPELINE_DEPTH).map(|_| vec![0u8; buffer_len]).collect(),
            buffer_len,
            consumer,
        }
    }

    /// Check a transfer buffer out of the pool, suspending until the
    /// consumer returns one if all are in flight.
    pub async fn buffer(&mut self) -> Vec<u8> {
        if let Some(buf) = self.free.pop() {
            return buf;
        }
        match self.returned.recv().await {
            Some(buf) => buf,
            // Consumer died; hand out a fresh buffer so the next send
            // surfaces the error.
            None => vec![0u8; self.buffer_len],
        }
    }

    pub async fn write_control(&mut self, bytes: Bytes) -> Result<()> {
        self.jobs
            .send(Job::Control(bytes))
            .await
            .map_err(|_| consumer_stopped())
    }

    pub async fn seek_raw(&mut self, offset: u64) -> Result<()> {
        self.jobs
            .send(Job::RawSeek(offset))
            .await
            .map_err(|_| consumer_stopped())
    }

    /// Enqueue one chunk of sector data; suspends while the queue is full.
    pub async fn send(&mut self, buf: Vec<u8>, len: usize) -> Result<()> {
        self.jobs
            .send(Job::Data { buf, len })
            .await
            .map_err(|_| consumer_stopped())
    }

    /// Wait until every outstanding job has been fully written.
    pub async fn flush(&mut self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.jobs
            .send(Job::Flush(ack_tx))
            .await
            .map_err(|_| consumer_stopped())?;
        ack_rx.await.map_err(|_| consumer_stopped())
    }

    /// Drain the queue, join the consumer, and hand back its sinks.
    /// Propagates the first error the consumer observed.
    pub async fn finish(self) -> Result<(W, Option<File>)> {
        drop(self.jobs);
        match self.consumer.await {
            Ok(result) => result,
            Err(join_err) => Err(DumpError::Pipeline(format!(
                "stream writer task failed: {join_err}"
            ))),
        }
    }
}

/// One unit of work handed from the restore-side producer to the session.
#[derive(Debug)]
pub enum RestoreJob {
    /// Start of a changed-block interval.
    Interval(CbtHeader),
    /// One payload chunk of the current interval.
    Data { buf: Vec<u8>, len: usize },
}

/// Restore-side pipeline: a spawned producer reads changed-block records
/// off the input stream while the session writes them to the backend.
pub struct StreamReader {
    jobs: mpsc::Receiver<RestoreJob>,
    returned: mpsc::Sender<Vec<u8>>,
    producer: JoinHandle<Result<()>>,
}

impl StreamReader {
    pub fn spawn<R>(mut reader: R, buffer_len: usize) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let (job_tx, job_rx) = mpsc::channel::<RestoreJob>(PIPELINE_DEPTH);
        let (return_tx, mut return_rx) = mpsc::channel::<Vec<u8>>(PIPELINE_DEPTH);

        let producer = tokio::spawn(async move {
            let mut free: Vec<Vec<u8>> =
                (0..PIPELINE_DEPTH).map(|_| vec![0u8; buffer_len]).collect();

            while let Some(header) = read_cbt_header(&mut reader).await? {
                if job_tx.send(RestoreJob::Interval(header)).await.is_err() {
                    return Ok(());
                }

                let mut remaining = header.length;
                while remaining > 0 {
                    let mut buf = match free.pop() {
                        Some(buf) => buf,
                        None => match return_rx.recv().await {
                            Some(buf) => buf,
                            None => return Ok(()),
                        },
                    };

                    let len = remaining.min(buffer_len as u64) as usize;
                    // Truncation inside a payload is an I/O error, not a
                    // framing error.
                    reader.read_exact(&mut buf[..len]).await?;
                    remaining -= len as u64;

                    if job_tx.send(RestoreJob::Data { buf, len }).await.is_err() {
                        return Ok(());
                    }
                }
            }
            Ok(())
        });

        Self {
            jobs: job_rx,
            returned: return_tx,
            producer,
        }
    }

    /// Next job in enqueue order; `None` once the producer has reached a
    /// clean end of stream and the queue is drained.
    pub async fn next(&mut self) -> Option<RestoreJob> {
        self.jobs.recv().await
    }

    /// Hand a drained buffer back to the producer's pool.
    pub fn recycle(&mut self, buf: Vec<u8>) {
        let _ = self.returned.try_send(buf);
    }

    /// Join the producer and propagate its framing or I/O error, if any.
    pub async fn finish(self) -> Result<()> {
        drop(self.jobs);
        drop(self.returned);
        match self.producer.await {
            Ok(result) => result,
            Err(join_err) => Err(DumpError::Pipeline(format!(
                "stream reader task failed: {join_err}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::protocol::write_cbt_header;
    use std::io::Cursor;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_jobs_processed_in_enqueue_order() {
        let mut pipeline = CopyPipeline::spawn(Vec::new(), None, 512);

        pipeline
            .write_control(Bytes::from_static(b"header-a"))
            .await
            .unwrap();
        let mut buf = pipeline.buffer().await;
        buf[..4].copy_from_slice(b"aaaa");
        pipeline.send(buf, 4).await.unwrap();

        pipeline
            .write_control(Bytes::from_static(b"header-b"))
            .await
            .unwrap();
        let mut buf = pipeline.buffer().await;
        buf[..4].copy_from_slice(b"bbbb");
        pipeline.send(buf, 4).await.unwrap();

        let (written, _) = pipeline.finish().await.unwrap();
        assert_eq!(written, b"header-aaaaaheader-bbbbb".to_vec());
    }

    #[tokio::test]
    async fn test_flush_returns_after_queue_drained() {
        let (writer, mut reader) = tokio::io::duplex(1024 * 1024);
        let mut pipeline = CopyPipeline::spawn(writer, None, 512);

        for _ in 0..8 {
            let buf = pipeline.buffer().await;
            pipeline.send(buf, 512).await.unwrap();
        }
        pipeline.flush().await.unwrap();

        // Everything must already be readable without waiting on the
        // consumer any further.
        let mut sink = vec![0u8; 8 * 512];
        reader.read_exact(&mut sink).await.unwrap();

        pipeline.finish().await.unwrap();
    }

    #[tokio::test]
    async fn test_raw_mirror_seeks_per_interval() {
        let tmp = TempDir::new().unwrap();
        let raw_path = tmp.path().join("raw.img");
        let raw = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&raw_path)
            .await
            .unwrap();

        let mut pipeline = CopyPipeline::spawn(Vec::new(), Some(raw), 512);

        // Second interval lands at offset 1024, leaving a hole.
        pipeline.seek_raw(0).await.unwrap();
        let mut buf = pipeline.buffer().await;
        buf[..512].fill(b'x');
        pipeline.send(buf, 512).await.unwrap();

        pipeline.seek_raw(1024).await.unwrap();
        let mut buf = pipeline.buffer().await;
        buf[..512].fill(b'y');
        pipeline.send(buf, 512).await.unwrap();

        pipeline.finish().await.unwrap();

        let raw = std::fs::read(&raw_path).unwrap();
        assert_eq!(raw.len(), 1536);
        assert!(raw[..512].iter().all(|&b| b == b'x'));
        assert!(raw[512..1024].iter().all(|&b| b == 0));
        assert!(raw[1024..].iter().all(|&b| b == b'y'));
    }

    #[tokio::test]
    async fn test_consumer_write_error_propagates() {
        let (writer, reader) = tokio::io::duplex(64);
        drop(reader);

        let mut pipeline = CopyPipeline::spawn(writer, None, 512);

        // The first send may be accepted before the consumer hits the
        // broken pipe; keep pushing until the failure surfaces.
        let mut send_failed = false;
        for _ in 0..16 {
            let buf = pipeline.buffer().await;
            if pipeline.send(buf, 512).await.is_err() {
                send_failed = true;
                break;
            }
        }
        let result = pipeline.finish().await;
        assert!(send_failed || result.is_err());
        if let Err(err) = result {
            assert!(matches!(err, DumpError::Io(_)), "{err}");
        }
    }

    async fn encode_interval(stream: &mut Vec<u8>, start: u64, payload: &[u8]) {
        write_cbt_header(
            stream,
            &CbtHeader {
                start_offset: start,
                length: payload.len() as u64,
            },
        )
        .await
        .unwrap();
        stream.extend_from_slice(payload);
    }

    #[tokio::test]
    async fn test_stream_reader_yields_jobs_in_order() {
        let mut stream = Vec::new();
        encode_interval(&mut stream, 0, &vec![b'a'; 1024]).await;
        encode_interval(&mut stream, 4096, &vec![b'b'; 512]).await;

        let mut reader = StreamReader::spawn(Cursor::new(stream), 512);

        let mut intervals = Vec::new();
        let mut payload = Vec::new();
        while let Some(job) = reader.next().await {
            match job {
                RestoreJob::Interval(header) => intervals.push(header),
                RestoreJob::Data { buf, len } => {
                    payload.extend_from_slice(&buf[..len]);
                    reader.recycle(buf);
                }
            }
        }
        reader.finish().await.unwrap();

        assert_eq!(
            intervals,
            vec![
                CbtHeader {
                    start_offset: 0,
                    length: 1024
                },
                CbtHeader {
                    start_offset: 4096,
                    length: 512
                },
            ]
        );
        assert_eq!(payload.len(), 1536);
        assert!(payload[..1024].iter().all(|&b| b == b'a'));
        assert!(payload[1024..].iter().all(|&b| b == b'b'));
    }

    #[tokio::test]
    async fn test_stream_reader_truncated_payload_is_io_error() {
        let mut stream = Vec::new();
        encode_interval(&mut stream, 0, &vec![b'a'; 1024]).await;
        stream.truncate(stream.len() - 100);

        let mut reader = StreamReader::spawn(Cursor::new(stream), 512);
        while let Some(job) = reader.next().await {
            if let RestoreJob::Data { buf, .. } = job {
                reader.recycle(buf);
            }
        }

        let err = reader.finish().await.unwrap_err();
        assert!(matches!(err, DumpError::Io(_)), "{err}");
    }

    #[tokio::test]
    async fn test_stream_reader_bad_magic_is_framing_error() {
        let mut stream = Vec::new();
        encode_interval(&mut stream, 0, &vec![b'a'; 512]).await;
        stream[0] ^= 0xff;

        let mut reader = StreamReader::spawn(Cursor::new(stream), 512);
        while reader.next().await.is_some() {}

        let err = reader.finish().await.unwrap_err();
        assert!(matches!(err, DumpError::Framing(_)), "{err}");
    }
}
