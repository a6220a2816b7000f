//! The crate-wide error type and a few conversions from the errors of the
//! libraries we build on.
//!
//! There is no error-derive dependency in this crate (the teacher crate this
//! is built on didn't carry one either), so this is a hand rolled
//! `std::error::Error` impl plus a handful of `From` conversions so that `?`
//! composes across module boundaries.

use std::fmt;

/// The crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// All errors that may occur while running the engine.
#[derive(Debug)]
pub enum Error {
    /// Wraps an IO error, whether from the network or disk.
    Io(std::io::Error),
    /// The peer's handshake was malformed (wrong length, wrong protocol
    /// string).
    InvalidHandshake,
    /// The peer's handshake info hash didn't match ours.
    InvalidPeerInfoHash,
    /// Peer sent a bitfield message outside of the availability exchange
    /// state (i.e. not as the very first message after the handshake).
    BitfieldNotAfterHandshake,
    /// A peer-wire message was too short for its declared id.
    InvalidMessageLength,
    /// A block was received for a piece index outside of torrent bounds.
    InvalidPieceIndex,
    /// The metainfo could not be parsed as valid bencode.
    Bencode(serde_bencode::Error),
    /// The tracker could not be reached or returned a malformed response.
    Tracker(String),
    /// The tracker returned peers in the dictionary model, which this engine
    /// doesn't implement (see the Open Questions in the design notes).
    TrackerPeerFormatUnsupported,
    /// Shutdown was requested; sessions should wind down cooperatively. This
    /// is not a user visible error: the orchestrator intercepts it and
    /// returns `Ok(())`.
    ShutdownRequested,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io error: {}", e),
            Self::InvalidHandshake => write!(f, "invalid handshake"),
            Self::InvalidPeerInfoHash => {
                write!(f, "peer handshake info hash mismatch")
            }
            Self::BitfieldNotAfterHandshake => {
                write!(f, "bitfield message sent outside availability exchange")
            }
            Self::InvalidMessageLength => {
                write!(f, "peer message payload too short for its id")
            }
            Self::InvalidPieceIndex => write!(f, "invalid piece index"),
            Self::Bencode(e) => write!(f, "bencode error: {}", e),
            Self::Tracker(msg) => write!(f, "tracker error: {}", msg),
            Self::TrackerPeerFormatUnsupported => write!(
                f,
                "tracker returned peers in the dictionary model, which is not supported"
            ),
            Self::ShutdownRequested => write!(f, "shutdown requested"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Bencode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_bencode::Error> for Error {
    fn from(e: serde_bencode::Error) -> Self {
        Self::Bencode(e)
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Self::Tracker(e.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Self::Tracker(e.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        // the only reason a send on one of our internal channels fails is
        // that the receiving task has already shut down
        Self::ShutdownRequested
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_does_not_panic() {
        let errs = [
            Error::InvalidHandshake,
            Error::InvalidPeerInfoHash,
            Error::BitfieldNotAfterHandshake,
            Error::InvalidMessageLength,
            Error::InvalidPieceIndex,
            Error::TrackerPeerFormatUnsupported,
            Error::ShutdownRequested,
        ];
        for e in &errs {
            assert!(!format!("{}", e).is_empty());
        }
    }
}
