/*!
 * Background stream forwarding
 *
 * A [`StreamForwarder`] copies one input stream into at most one output
 * stream on its own task. Errors are logged and end the pump; they are
 * never propagated. Callers learn that forwarding stopped through
 * [`StreamForwarder::terminate`].
 */

use bytes::{Bytes, BytesMut};
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const BUFFER_SIZE: usize = 8 * 1024;

/// Byte pump from one stream to another
#[derive(Debug)]
pub struct StreamForwarder {
    name: String,
    handle: JoinHandle<u64>,
}

impl StreamForwarder {
    /// Start pumping `input` into `output` (or into nothing)
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<R, W>(name: &str, input: R, output: Option<W>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let name = name.to_string();
        let task_name = name.clone();
        let handle = tokio::spawn(async move { pump(&task_name, input, output).await });
        Self { name, handle }
    }

    /// Start a pump that reads and discards its input
    pub fn discard<R>(name: &str, input: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self::new::<R, tokio::io::Sink>(name, input, None)
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait up to `timeout` for the pump to finish, then force it closed
    ///
    /// A zero timeout forces the pump closed without waiting. Returns `true`
    /// if the pump had finished on its own.
    pub async fn terminate(self, timeout: Duration) -> bool {
        let StreamForwarder { name, mut handle } = self;

        if handle.is_finished() {
            return true;
        }

        if !timeout.is_zero() {
            if let Ok(joined) = tokio::time::timeout(timeout, &mut handle).await {
                if let Ok(bytes) = joined {
                    debug!(stream = %name, bytes, "forwarder finished");
                }
                return true;
            }
        }

        // Aborting drops the task, and with it both streams
        handle.abort();
        debug!(stream = %name, "forwarder force-closed");
        false
    }
}

async fn pump<R, W>(name: &str, mut input: R, mut output: Option<W>) -> u64
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = match input.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(stream = %name, "error reading forwarded stream: {}", e);
                break;
            }
        };
        total += n as u64;

        if let Some(out) = output.as_mut() {
            let written = match out.write_all(&buffer[..n]).await {
                Ok(()) => out.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                warn!(stream = %name, "error writing forwarded stream: {}", e);
                break;
            }
        }
    }

    if let Some(mut out) = output {
        if let Err(e) = out.shutdown().await {
            debug!(stream = %name, "error closing forwarded output: {}", e);
        }
    }

    total
}

/// In-memory sink whose contents can be read while it is being written
#[derive(Debug, Clone, Default)]
pub struct CaptureBuffer {
    inner: Arc<Mutex<BytesMut>>,
}

impl CaptureBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the bytes written so far
    pub fn contents(&self) -> Bytes {
        match self.inner.lock() {
            Ok(guard) => Bytes::copy_from_slice(&guard),
            Err(poisoned) => Bytes::copy_from_slice(&poisoned.into_inner()),
        }
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }

    pub fn len(&self) -> usize {
        self.contents().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AsyncWrite for CaptureBuffer {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| io::Error::other("capture buffer poisoned"))?;
        guard.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_forwards_all_bytes_in_order() {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let (mut writer, reader) = tokio::io::duplex(1024);
        let capture = CaptureBuffer::new();

        let forwarder = StreamForwarder::new("test", reader, Some(capture.clone()));

        writer.write_all(&data).await.unwrap();
        drop(writer);

        // Let the pump drain naturally
        let deadline = Instant::now() + Duration::from_secs(5);
        while !forwarder.is_finished() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let started = Instant::now();
        assert!(forwarder.terminate(Duration::from_secs(10)).await);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(capture.contents().as_ref(), data.as_slice());
    }

    #[tokio::test]
    async fn test_never_ending_input_is_force_closed() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let capture = CaptureBuffer::new();
        let forwarder = StreamForwarder::new("stuck", reader, Some(capture.clone()));

        let started = Instant::now();
        assert!(!forwarder.terminate(Duration::from_millis(100)).await);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(600));

        // Give the runtime a moment to drop the aborted task
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(writer.write_all(b"late").await.is_err());
        assert!(capture.is_empty());
    }

    #[tokio::test]
    async fn test_zero_timeout_forces_immediately() {
        let (_writer, reader) = tokio::io::duplex(64);
        let forwarder = StreamForwarder::discard("stuck", reader);

        let started = Instant::now();
        assert!(!forwarder.terminate(Duration::ZERO).await);
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_discarding_forwarder_drains_input() {
        let (mut writer, reader) = tokio::io::duplex(16);
        let forwarder = StreamForwarder::discard("discard", reader);

        // More than the pipe capacity, so this only completes if the pump reads
        writer.write_all(&[7u8; 4096]).await.unwrap();
        drop(writer);

        assert!(forwarder.terminate(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_pump_errors_are_swallowed() {
        struct Broken;

        impl AsyncRead for Broken {
            fn poll_read(
                self: Pin<&mut Self>,
                _cx: &mut Context<'_>,
                _buf: &mut tokio::io::ReadBuf<'_>,
            ) -> Poll<io::Result<()>> {
                Poll::Ready(Err(io::Error::new(io::ErrorKind::ConnectionReset, "boom")))
            }
        }

        let forwarder = StreamForwarder::discard("broken", Broken);
        assert!(forwarder.terminate(Duration::from_secs(1)).await);
    }
}
