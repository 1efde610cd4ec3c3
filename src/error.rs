//! Crate-wide error types.

use thiserror::Error;

/// Errors produced while dissecting a raw IPFIX message.
///
/// A `DissectError` always refers to the message as a whole: set-level and
/// record-level damage is handled inline by the walkers (stop at the damaged
/// record, keep what was already parsed) and surfaces as warnings instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DissectError {
    /// Fewer bytes arrived than a 16-octet IPFIX message header.
    #[error("message too short for an IPFIX header (got {available} octets)")]
    TruncatedHeader {
        /// Number of bytes that were available
        available: usize,
    },

    /// The version field of the header was not 10.
    #[error("unsupported protocol version {version} (expected 10)")]
    UnsupportedVersion {
        /// The version number found in the packet
        version: u16,
    },

    /// The header declares more octets than the buffer holds.
    #[error("header declares {declared} octets but only {available} arrived")]
    TruncatedMessage {
        /// Length from the message header
        declared: usize,
        /// Number of bytes that were available
        available: usize,
    },

    /// A set or record could not be walked at the given buffer offset.
    #[error("malformed set at offset {offset}: {context}")]
    MalformedSet {
        /// Offset in bytes where the error occurred
        offset: usize,
        /// Description of what was being parsed
        context: String,
    },

    /// A template record could not be parsed at the given buffer offset.
    #[error("malformed template record at offset {offset}: {context}")]
    MalformedTemplate {
        /// Offset in bytes where the error occurred
        offset: usize,
        /// Description of what was being parsed
        context: String,
    },
}

/// A source has used up all 65 280 collector-assignable template ids.
///
/// Assigned ids are monotone within a (source, observation domain) scope and
/// never wrap, so running out is terminal for that source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("collector template id space exhausted for this source")]
pub struct TemplateIdSpaceExhausted;

/// Errors raised while building a [`Pipeline`](crate::Pipeline).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Ring capacity must be greater than 0
    #[error("invalid ring capacity {0}; must be greater than 0")]
    InvalidRingCapacity(usize),

    /// Template dictionary capacity must be greater than 0
    #[error("invalid template dictionary capacity {0}; must be greater than 0")]
    InvalidTemplateCapacity(usize),
}
