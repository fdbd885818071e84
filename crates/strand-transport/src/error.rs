//! Error taxonomy for the Strand transport.
//!
//! Wire-level and fragment-level failures are recovered locally by the
//! endpoint (the offending datagram or assembly is dropped and a counter
//! bumped); `PayloadTooLarge`, `EmptyPayload`, `NotRunning`, and `Transport`
//! surface to the caller of `send`.

use std::io;
use thiserror::Error;

/// Failures produced by the Strand transport.
#[derive(Debug, Error)]
pub enum Error {
    /// The datagram is too short, carries an unknown kind byte, a bad
    /// trailer, or fragment header fields out of range.
    #[error("malformed header: {reason}")]
    MalformedHeader {
        /// What exactly was wrong with the header.
        reason: &'static str,
    },

    /// A fragment reported a different total than the assembly it targets.
    #[error("fragment total for sequence {sequence} changed from {expected} to {got}")]
    FragmentMismatch {
        /// Sequence the assembly is keyed under.
        sequence: u16,
        /// Total recorded when the assembly was created.
        expected: u8,
        /// Total claimed by the offending fragment.
        got: u8,
    },

    /// A duplicate fragment arrived with bytes that differ from the part
    /// already recorded.
    #[error("conflicting data for fragment {fragment_id} of sequence {sequence}")]
    FragmentConflict {
        /// Sequence the assembly is keyed under.
        sequence: u16,
        /// Index of the conflicting fragment.
        fragment_id: u8,
    },

    /// An outbound payload cannot be carried, or a reconstructed payload
    /// exceeds the configured maximum.
    #[error("payload of {len} bytes exceeds the {max}-byte limit")]
    PayloadTooLarge {
        /// Offending payload length.
        len: usize,
        /// Limit that was exceeded.
        max: usize,
    },

    /// Zero-length payloads are not representable on the wire.
    #[error("payload must not be empty")]
    EmptyPayload,

    /// `send` or `on_datagram` was invoked outside the `Running` state.
    #[error("endpoint is not running")]
    NotRunning,

    /// The underlying socket failed.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
