//! 9P error representations.
//!
//! In 9P2000.L an error is reported to the peer as `Rlerror` carrying a Linux
//! errno; in 9P2000 it is `Rerror` carrying a string. Every [`Error`] maps to an
//! errno through [`Error::errno`], which is what a server session puts on the
//! wire.

use std::io;

use nix::errno::Errno;

use crate::fcall::{HEADER_SIZE, MsgType};

/// Errno values, re-exported so services can write `Error::No(errno::ENOENT)`.
pub mod errno {
    pub use nix::errno::Errno;
    pub use nix::errno::Errno::*;
}

/// Framing and wire-level failures.
///
/// These are produced while encoding or decoding frames and never carry
/// heap data, so they can be copied into every pending call on teardown.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("message too small: {size} bytes, type requires {min}")]
    MessageTooSmall { size: u32, min: u32 },
    #[error("message too large: {size} bytes exceeds msize {max}")]
    MessageTooLarge { size: u64, max: u32 },
    #[error("invalid message type {0}")]
    InvalidMessageType(u8),
    #[error("invalid UTF-8 sequence in string")]
    InvalidUtf8,
    #[error("name too large")]
    NameTooLarge,
    #[error("path too large")]
    PathTooLarge,
    #[error("too many walk elements")]
    MaxWalkElements,
    #[error("data too large")]
    DataTooLarge,
    #[error("unexpected end of input")]
    UnexpectedEof,
}

impl FrameError {
    /// Whether the decoder is still positioned on a frame boundary after
    /// reporting this error, i.e. the connection can keep going.
    pub fn is_recoverable(&self) -> bool {
        match *self {
            FrameError::MessageTooLarge { .. } => false,
            FrameError::MessageTooSmall { size, .. } => size >= HEADER_SIZE,
            _ => true,
        }
    }
}

/// The error type of this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A POSIX errno, either returned by a service or received in `Rlerror`.
    #[error("{}", .0.desc())]
    No(Errno),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    /// Error string received in a 9P2000 `Rerror`.
    #[error("remote error: {0}")]
    Remote(String),
    /// The connection was closed on purpose.
    #[error("connection shut down")]
    Shutdown,
    /// The connection broke while requests were outstanding.
    #[error("unexpected end of file")]
    UnexpectedEof,
    #[error("out of tags")]
    OutOfTags,
    #[error("out of fids")]
    OutOfFids,
    #[error("protocol version {0:?} not supported")]
    VersionNotSupported(String),
    #[error("unexpected message {0:?}")]
    UnexpectedMessage(MsgType),
    /// The request was cancelled with Tflush before a reply arrived.
    #[error("request flushed")]
    Flushed,
}

impl Error {
    /// Get the errno which represents this error.
    pub fn errno(&self) -> Errno {
        match *self {
            Error::No(e) => e,
            Error::Io(ref e) => io_errno(e),
            Error::Frame(e) => match e {
                FrameError::MessageTooLarge { .. } | FrameError::DataTooLarge => Errno::EMSGSIZE,
                FrameError::NameTooLarge | FrameError::PathTooLarge => Errno::ENAMETOOLONG,
                FrameError::InvalidMessageType(_) => Errno::EOPNOTSUPP,
                _ => Errno::EINVAL,
            },
            Error::Remote(_) => Errno::EIO,
            Error::Shutdown | Error::UnexpectedEof => Errno::EIO,
            Error::OutOfTags => Errno::EAGAIN,
            Error::OutOfFids => Errno::EMFILE,
            Error::VersionNotSupported(_) => Errno::EPROTONOSUPPORT,
            Error::UnexpectedMessage(_) => Errno::EPROTO,
            Error::Flushed => Errno::EINTR,
        }
    }

    /// Build the error a client reports for an `Rlerror`.
    pub fn from_ecode(ecode: u32) -> Error {
        Error::No(Errno::from_raw(ecode as i32))
    }
}

fn io_errno(e: &io::Error) -> Errno {
    if let Some(code) = e.raw_os_error() {
        return Errno::from_raw(code);
    }

    match e.kind() {
        io::ErrorKind::NotFound => Errno::ENOENT,
        io::ErrorKind::PermissionDenied => Errno::EACCES,
        io::ErrorKind::AlreadyExists => Errno::EEXIST,
        io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => Errno::EINVAL,
        io::ErrorKind::Unsupported => Errno::EOPNOTSUPP,
        io::ErrorKind::WouldBlock => Errno::EAGAIN,
        io::ErrorKind::Interrupted => Errno::EINTR,
        _ => Errno::EIO,
    }
}

impl From<Errno> for Error {
    fn from(e: Errno) -> Self {
        Error::No(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_unwrap_to_os_errno() {
        let e = Error::Io(io::Error::from_raw_os_error(Errno::ENOTDIR as i32));
        assert_eq!(e.errno(), Errno::ENOTDIR);

        let e = Error::Io(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert_eq!(e.errno(), Errno::ENOENT);

        let e = Error::Io(io::Error::other("opaque"));
        assert_eq!(e.errno(), Errno::EIO);
    }

    #[test]
    fn frame_errors_map_to_errno() {
        let e = Error::from(FrameError::MessageTooLarge { size: 9, max: 8 });
        assert_eq!(e.errno(), Errno::EMSGSIZE);
        assert_eq!(Error::from(FrameError::InvalidUtf8).errno(), Errno::EINVAL);
        assert_eq!(Error::OutOfFids.errno(), Errno::EMFILE);
    }

    #[test]
    fn ecode_round_trips() {
        let e = Error::from_ecode(Errno::ENOENT as u32);
        assert_eq!(e.errno(), Errno::ENOENT);
        assert!(!FrameError::MessageTooLarge { size: 1, max: 0 }.is_recoverable());
        assert!(FrameError::InvalidMessageType(6).is_recoverable());
        assert!(FrameError::MessageTooSmall { size: 7, min: 11 }.is_recoverable());
        assert!(!FrameError::MessageTooSmall { size: 3, min: 7 }.is_recoverable());
    }
}
