//! EOF-aware byte channel over an OS pipe.
//!
//! Connects a producer stage to the consumer stage that follows it when the
//! producer is declared `pipe_with_next`. Both ends are plain file descriptors,
//! so the same channel works between two threads or across a process boundary
//! (the shim receives its end on fd 3).
//!
//! # Lifecycle
//!
//! 1. `create_reader_writer_pair()` opens the pipe (close-on-exec)
//! 2. The writer goes to the producer, the reader to the consumer
//! 3. Producer calls `write` any number of times, then `write_eof` exactly once
//! 4. Consumer calls `read` until it returns an empty buffer
//! 5. Both ends drop, closing the fds
//!
//! End-of-stream is an explicit frame, not the pipe closing. A reader whose
//! peer vanished without sending EOF gets an error instead of a short stream.
//!
//! # Example
//!
//! ```ignore
//! let (mut reader, mut writer) = create_reader_writer_pair()?;
//! std::thread::spawn(move || {
//!     writer.write(b"hello ")?;
//!     writer.write_eof(b"world")
//! });
//! assert_eq!(reader.read_to_end()?, b"hello world");
//! ```

mod reader;
mod writer;

pub use reader::ChannelReader;
pub use writer::ChannelWriter;

use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use nix::unistd::pipe;
use std::os::fd::{AsRawFd, OwnedFd};
use workpipe_shared::errors::{WorkpipeError, WorkpipeResult};

/// Which side of the channel an endpoint is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    Reader,
    Writer,
}

impl ChannelRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelRole::Reader => "reader",
            ChannelRole::Writer => "writer",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "reader" => Some(ChannelRole::Reader),
            "writer" => Some(ChannelRole::Writer),
            _ => None,
        }
    }
}

/// Either end of a channel, as handed to a stage.
#[derive(Debug)]
pub enum ChannelEndpoint {
    Reader(ChannelReader),
    Writer(ChannelWriter),
}

impl ChannelEndpoint {
    pub fn role(&self) -> ChannelRole {
        match self {
            ChannelEndpoint::Reader(_) => ChannelRole::Reader,
            ChannelEndpoint::Writer(_) => ChannelRole::Writer,
        }
    }

    /// Release the underlying descriptor (used to hand it to a child process).
    pub fn into_owned_fd(self) -> Option<OwnedFd> {
        match self {
            ChannelEndpoint::Reader(reader) => reader.into_owned_fd(),
            ChannelEndpoint::Writer(writer) => writer.into_owned_fd(),
        }
    }

    /// Rebuild an endpoint from a descriptor received from the host.
    pub fn from_owned_fd(role: ChannelRole, fd: OwnedFd) -> Self {
        match role {
            ChannelRole::Reader => ChannelEndpoint::Reader(ChannelReader::from_owned_fd(fd)),
            ChannelRole::Writer => ChannelEndpoint::Writer(ChannelWriter::from_owned_fd(fd)),
        }
    }
}

/// Create a connected `(reader, writer)` pair.
///
/// # Errors
///
/// Returns error if pipe creation fails (e.g. fd exhaustion).
pub fn create_reader_writer_pair() -> WorkpipeResult<(ChannelReader, ChannelWriter)> {
    let (rx, tx) = pipe()
        .map_err(|e| WorkpipeError::Channel(format!("Failed to create channel pipe: {}", e)))?;

    set_cloexec(&rx)?;
    set_cloexec(&tx)?;

    tracing::trace!(
        reader_fd = rx.as_raw_fd(),
        writer_fd = tx.as_raw_fd(),
        "Created channel pipe"
    );

    Ok((ChannelReader::from_owned_fd(rx), ChannelWriter::from_owned_fd(tx)))
}

/// Keep channel fds out of unrelated children; the launcher `dup2`s the one
/// endpoint a shim needs, which clears the flag on the copy.
fn set_cloexec(fd: &OwnedFd) -> WorkpipeResult<()> {
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(|e| {
        WorkpipeError::Channel(format!(
            "Failed to set close-on-exec on fd {}: {}",
            fd.as_raw_fd(),
            e
        ))
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_fds_are_cloexec() {
        let (mut reader, mut writer) = create_reader_writer_pair().unwrap();
        let rx = reader.as_raw_fd().unwrap();
        let tx = writer.as_raw_fd().unwrap();
        assert_ne!(rx, tx);

        for fd in [rx, tx] {
            // SAFETY: both fds stay open until the close calls below.
            let fd = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
            let flags = FdFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFD).unwrap());
            assert!(flags.contains(FdFlag::FD_CLOEXEC));
        }

        writer.close().unwrap();
        reader.close().unwrap();
    }

    #[test]
    fn test_role_round_trip() {
        for role in [ChannelRole::Reader, ChannelRole::Writer] {
            assert_eq!(ChannelRole::parse(role.as_str()), Some(role));
        }
        assert_eq!(ChannelRole::parse("duplex"), None);
    }

    #[test]
    fn test_endpoint_role() {
        let (reader, writer) = create_reader_writer_pair().unwrap();
        assert_eq!(ChannelEndpoint::Reader(reader).role(), ChannelRole::Reader);
        assert_eq!(ChannelEndpoint::Writer(writer).role(), ChannelRole::Writer);
    }
}
