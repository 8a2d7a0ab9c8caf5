//! Error types for the wire protocol and transport layers.

use std::time::Duration;

/// Maximum size of a framed message in bytes, including the 2-byte length
/// header.
pub const MAX_FRAME_SIZE: usize = 1024;

/// Length of the frame header (u16 little-endian length prefix).
pub const HEADER_LEN: usize = 2;

/// Maximum value of the length prefix (tag byte + payload).
pub const MAX_FRAME_LEN: usize = MAX_FRAME_SIZE - HEADER_LEN;

/// Result alias for codec operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors produced while encoding or decoding messages.
///
/// Every variant is terminal for the connection that produced it: the
/// admission pipeline marks the offending entry inactive and the connection
/// is dropped.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The tag byte does not name a known message kind.
    #[error("unknown message kind: tag {tag:#04x}")]
    UnknownKind {
        /// The offending tag byte.
        tag: u8,
    },

    /// A message does not fit the frame limit.
    #[error("frame length {len} exceeds limit {max}")]
    LengthOverflow {
        /// Length the message would need.
        len: usize,
        /// Maximum length the frame format allows.
        max: usize,
    },

    /// The buffer ended before the advertised field lengths were satisfied.
    #[error("truncated message: needed {needed} bytes, had {have}")]
    Truncated {
        /// Bytes the decoder needed to make progress.
        needed: usize,
        /// Bytes actually available.
        have: usize,
    },
}

/// Errors produced by [`Transport`](super::Transport) send/receive paths.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Unrecoverable socket error.
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the connection before a frame completed.
    #[error("connection closed by peer")]
    Closed,

    /// The length prefix announced a frame beyond the protocol limit.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The transport was constructed with a zero read timeout.
    ///
    /// The receive loop relies on the per-read timeout firing to observe its
    /// time budget elapsing; a zero timeout would block a worker forever on
    /// an idle peer.
    #[error("read timeout must be non-zero (got {0:?})")]
    ZeroReadTimeout(Duration),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_limit_accounts_for_header() {
        assert_eq!(MAX_FRAME_LEN + HEADER_LEN, MAX_FRAME_SIZE);
    }

    #[test]
    fn error_display_names_the_tag() {
        let err = ProtocolError::UnknownKind { tag: 0x0d };
        assert_eq!(err.to_string(), "unknown message kind: tag 0x0d");
    }
}
