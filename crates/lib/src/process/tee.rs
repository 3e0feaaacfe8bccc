//! Fan-out of a process stream to a file and an optional consumer.
//!
//! One reader pulls from the source and writes every chunk to the file. The
//! consumer side is a duplex pipe; when the consumer hangs up early its
//! writes start failing with `BrokenPipe`, after which it is skipped and the
//! file still receives the rest of the stream.

use std::io;
use std::path::Path;

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tracing::debug;

const CHUNK_SIZE: usize = 8 * 1024;

/// Bytes copied and whether the consumer received all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeeSummary {
  pub bytes: u64,
  pub consumer_complete: bool,
}

/// Copy `source` into `file` and, while it keeps reading, into `consumer`.
/// The consumer is closed when the source ends so it observes EOF.
pub async fn tee<R>(mut source: R, file: &Path, mut consumer: Option<DuplexStream>) -> io::Result<TeeSummary>
where
  R: AsyncRead + Unpin,
{
  let mut sink = File::create(file).await?;
  let mut buf = vec![0u8; CHUNK_SIZE];
  let mut bytes = 0u64;
  let mut consumer_complete = consumer.is_some();

  loop {
    let n = source.read(&mut buf).await?;
    if n == 0 {
      break;
    }
    sink.write_all(&buf[..n]).await?;
    bytes += n as u64;

    if let Some(writer) = consumer.as_mut()
      && let Err(e) = write_to_consumer(writer, &buf[..n]).await
    {
      if e.kind() != io::ErrorKind::BrokenPipe {
        debug!(error = %e, "tee consumer failed");
      }
      consumer = None;
      consumer_complete = false;
    }
  }

  sink.flush().await?;
  if let Some(mut writer) = consumer {
    // A consumer that hung up after the last chunk makes this fail.
    if writer.shutdown().await.is_err() {
      consumer_complete = false;
    }
  }
  Ok(TeeSummary {
    bytes,
    consumer_complete,
  })
}

async fn write_to_consumer<W: AsyncWrite + Unpin>(writer: &mut W, chunk: &[u8]) -> io::Result<()> {
  writer.write_all(chunk).await?;
  writer.flush().await
}
