use std::io::{ErrorKind, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;

use crate::codec::{encode_frame_into, FrameConfig};
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Writes complete frames to any `Write` stream.
///
/// A write timeout on the underlying socket never tears a frame: short
/// writes and timeouts are retried until the whole buffer is out, unless the
/// attached cancel flag is raised or the stall timeout passes without any
/// bytes being accepted.
pub struct FrameWriter<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
    cancel: Option<Arc<AtomicBool>>,
    stall_timeout: Option<Duration>,
}

impl<T: Write> FrameWriter<T> {
    /// Create a new frame writer with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame writer with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
            cancel: None,
            stall_timeout: None,
        }
    }

    /// Abort blocked writes with [`FrameError::Cancelled`] once `flag` is set.
    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Fail with [`FrameError::Stalled`] when the stream accepts no bytes
    /// for `timeout`.
    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = Some(timeout);
        self
    }

    /// Frame and send a payload.
    pub fn send(&mut self, payload: &[u8]) -> Result<()> {
        self.buf.clear();
        encode_frame_into(payload, self.config.max_payload_size, &mut self.buf)?;

        let buf = std::mem::take(&mut self.buf);
        let result = self.write_all_retrying(&buf);
        self.buf = buf;
        result?;
        self.flush()
    }

    /// Write bytes that already carry their length prefix.
    pub fn write_framed(&mut self, framed: &[u8]) -> Result<()> {
        self.write_all_retrying(framed)?;
        self.flush()
    }

    fn write_all_retrying(&mut self, bytes: &[u8]) -> Result<()> {
        let mut offset = 0usize;
        let mut progress = Instant::now();
        while offset < bytes.len() {
            self.check_cancel()?;
            match self.inner.write(&bytes[offset..]) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => {
                    offset += n;
                    progress = Instant::now();
                }
                Err(err) if is_retryable(err.kind()) => self.check_stall(progress)?,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
        Ok(())
    }

    /// Flush the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        let started = Instant::now();
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if is_retryable(err.kind()) => {
                    self.check_cancel()?;
                    self.check_stall(started)?;
                }
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    fn check_cancel(&self) -> Result<()> {
        match &self.cancel {
            Some(flag) if flag.load(Ordering::SeqCst) => Err(FrameError::Cancelled),
            _ => Ok(()),
        }
    }

    fn check_stall(&self, since: Instant) -> Result<()> {
        match self.stall_timeout {
            Some(timeout) if since.elapsed() >= timeout => Err(FrameError::Stalled(timeout)),
            _ => Ok(()),
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Update maximum payload size for subsequent frame encoding.
    pub fn set_max_payload_size(&mut self, max_payload_size: usize) {
        self.config.max_payload_size = max_payload_size;
    }

    /// Current frame writer configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl FrameWriter<TcpStream> {
    /// Create a frame writer for a TCP stream and apply the write timeout from config.
    pub fn with_config_tcp(inner: TcpStream, config: FrameConfig) -> Result<Self> {
        inner.set_write_timeout(config.write_timeout)?;
        Ok(Self::with_config(inner, config))
    }
}

fn is_retryable(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
    )
}
