//! Consumer end of a byte channel.

use super::writer::into_io_error;
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use workpipe_shared::errors::{WorkpipeError, WorkpipeResult};
use workpipe_shared::wire::{FRAME_HEADER_LEN, FrameKind, decode_header};

/// Reading end of a channel.
#[derive(Debug)]
pub struct ChannelReader {
    inner: Option<BufReader<File>>,
    eof: bool,
    bytes_read: u64,
    /// Leftover bytes of a frame partially consumed through `io::Read`.
    pending: Vec<u8>,
    pending_pos: usize,
}

impl ChannelReader {
    pub(crate) fn from_owned_fd(fd: OwnedFd) -> Self {
        Self {
            inner: Some(BufReader::new(File::from(fd))),
            eof: false,
            bytes_read: 0,
            pending: Vec::new(),
            pending_pos: 0,
        }
    }

    /// Read the next chunk of bytes, blocking until data or EOF arrives.
    ///
    /// Returns an empty buffer once end-of-stream has been reached, and on
    /// every call after that.
    ///
    /// # Errors
    ///
    /// Returns [`WorkpipeError::Channel`] if the writer went away without
    /// sending EOF or the stream is malformed.
    pub fn read(&mut self) -> WorkpipeResult<Vec<u8>> {
        if self.pending_pos < self.pending.len() {
            let rest = self.pending.split_off(self.pending_pos);
            self.pending.clear();
            self.pending_pos = 0;
            return Ok(rest);
        }
        if self.eof {
            return Ok(Vec::new());
        }

        loop {
            let (kind, len) = self.read_header()?;
            let body = self.read_body(len)?;
            self.bytes_read += body.len() as u64;

            match kind {
                FrameKind::Data if body.is_empty() => continue,
                FrameKind::Data => return Ok(body),
                FrameKind::Eof => {
                    self.eof = true;
                    tracing::trace!(total_bytes = self.bytes_read, "Channel reader reached EOF");
                    return Ok(body);
                }
            }
        }
    }

    /// Read until EOF and return everything received.
    pub fn read_to_end(&mut self) -> WorkpipeResult<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            let chunk = self.read()?;
            if chunk.is_empty() && self.eof {
                return Ok(out);
            }
            out.extend_from_slice(&chunk);
        }
    }

    pub fn close(&mut self) -> WorkpipeResult<()> {
        self.inner.take();
        Ok(())
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Cumulative payload bytes received (frame headers excluded).
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn as_raw_fd(&self) -> Option<RawFd> {
        self.inner.as_ref().map(|r| r.get_ref().as_raw_fd())
    }

    /// Bytes already buffered in user space are lost; only call before reading.
    pub(crate) fn into_owned_fd(mut self) -> Option<OwnedFd> {
        self.inner.take().map(|r| OwnedFd::from(r.into_inner()))
    }

    fn source(&mut self) -> WorkpipeResult<&mut BufReader<File>> {
        self.inner
            .as_mut()
            .ok_or_else(|| WorkpipeError::Channel("reader is closed".into()))
    }

    fn read_header(&mut self) -> WorkpipeResult<(FrameKind, usize)> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        self.source()?
            .read_exact(&mut header)
            .map_err(|e| match e.kind() {
                ErrorKind::UnexpectedEof => {
                    WorkpipeError::Channel("peer closed before EOF".into())
                }
                _ => WorkpipeError::Channel(format!("Failed to read frame header: {}", e)),
            })?;
        decode_header(&header)
    }

    fn read_body(&mut self, len: usize) -> WorkpipeResult<Vec<u8>> {
        let mut body = vec![0u8; len];
        self.source()?
            .read_exact(&mut body)
            .map_err(|e| WorkpipeError::Channel(format!("Truncated frame body: {}", e)))?;
        Ok(body)
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.pending_pos >= self.pending.len() {
            self.pending = ChannelReader::read(self).map_err(into_io_error)?;
            self.pending_pos = 0;
            if self.pending.is_empty() {
                return Ok(0);
            }
        }
        let available = &self.pending[self.pending_pos..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.pending_pos += n;
        Ok(n)
    }
}
