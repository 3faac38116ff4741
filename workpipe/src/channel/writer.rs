//! Producer end of a byte channel.

use std::fs::File;
use std::io::Write;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use workpipe_shared::errors::{WorkpipeError, WorkpipeResult};
use workpipe_shared::wire::{FrameKind, MAX_FRAME_BODY, encode_header};

/// Writing end of a channel.
///
/// Data is framed; `write_eof` sends the terminating frame. Once EOF is sent
/// every further write fails with [`WorkpipeError::AlreadyAtEof`].
#[derive(Debug)]
pub struct ChannelWriter {
    file: Option<File>,
    eof_sent: bool,
    bytes_written: u64,
}

impl ChannelWriter {
    pub(crate) fn from_owned_fd(fd: OwnedFd) -> Self {
        Self {
            file: Some(File::from(fd)),
            eof_sent: false,
            bytes_written: 0,
        }
    }

    /// Write `data` as one or more data frames. Returns the number of payload bytes written.
    pub fn write(&mut self, data: &[u8]) -> WorkpipeResult<usize> {
        if self.eof_sent {
            return Err(WorkpipeError::AlreadyAtEof);
        }
        self.write_data(data)
    }

    /// Write final bytes (possibly empty) and mark end-of-stream.
    ///
    /// Calling this a second time is a programming error and fails with
    /// [`WorkpipeError::AlreadyAtEof`].
    pub fn write_eof(&mut self, data: &[u8]) -> WorkpipeResult<usize> {
        if self.eof_sent {
            return Err(WorkpipeError::AlreadyAtEof);
        }
        let written = self.write_data(data)?;
        self.write_frame(FrameKind::Eof, &[])?;
        self.eof_sent = true;

        tracing::trace!(total_bytes = self.bytes_written, "Channel writer sent EOF");
        Ok(written)
    }

    /// Close the descriptor. A reader that has not seen EOF will get a channel error.
    pub fn close(&mut self) -> WorkpipeResult<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        Ok(())
    }

    pub fn is_eof_sent(&self) -> bool {
        self.eof_sent
    }

    /// Cumulative payload bytes written (frame headers excluded).
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn as_raw_fd(&self) -> Option<RawFd> {
        self.file.as_ref().map(|f| f.as_raw_fd())
    }

    pub(crate) fn into_owned_fd(mut self) -> Option<OwnedFd> {
        self.file.take().map(OwnedFd::from)
    }

    fn write_data(&mut self, data: &[u8]) -> WorkpipeResult<usize> {
        for chunk in data.chunks(MAX_FRAME_BODY) {
            self.write_frame(FrameKind::Data, chunk)?;
        }
        self.bytes_written += data.len() as u64;
        Ok(data.len())
    }

    fn write_frame(&mut self, kind: FrameKind, body: &[u8]) -> WorkpipeResult<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| WorkpipeError::Channel("writer is closed".into()))?;
        let header = encode_header(kind, body.len())?;
        file.write_all(&header)
            .and_then(|_| file.write_all(body))
            .map_err(|e| WorkpipeError::Channel(format!("Failed to write frame: {}", e)))
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        ChannelWriter::write(self, buf).map_err(into_io_error)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

pub(super) fn into_io_error(err: WorkpipeError) -> std::io::Error {
    match err {
        WorkpipeError::Io(e) => e,
        other => std::io::Error::other(other),
    }
}

#[cfg(test)]
mod tests {
    use crate::channel::create_reader_writer_pair;
    use workpipe_shared::errors::WorkpipeError;

    #[test]
    fn test_empty_write_sends_nothing() {
        let (mut reader, mut writer) = create_reader_writer_pair().unwrap();
        assert_eq!(writer.write(b"").unwrap(), 0);
        writer.write_eof(b"").unwrap();
        assert!(reader.read().unwrap().is_empty());
        assert!(reader.is_eof());
    }

    #[test]
    fn test_write_after_eof_fails() {
        let (_reader, mut writer) = create_reader_writer_pair().unwrap();
        writer.write_eof(b"done").unwrap();
        assert!(writer.is_eof_sent());
        assert!(matches!(writer.write(b"more"), Err(WorkpipeError::AlreadyAtEof)));
        assert!(matches!(writer.write_eof(b""), Err(WorkpipeError::AlreadyAtEof)));
        assert_eq!(writer.bytes_written(), 4);
    }

    #[test]
    fn test_write_after_close_fails() {
        let (_reader, mut writer) = create_reader_writer_pair().unwrap();
        writer.close().unwrap();
        assert!(matches!(writer.write(b"x"), Err(WorkpipeError::Channel(_))));
    }

    #[test]
    fn test_io_write_impl() {
        use std::io::Write;

        let (mut reader, mut writer) = create_reader_writer_pair().unwrap();
        write!(writer, "{}-{}", 1, 2).unwrap();
        writer.write_eof(b"").unwrap();
        assert_eq!(reader.read_to_end().unwrap(), b"1-2");
    }
}
