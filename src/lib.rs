#![deny(
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unused_import_braces,
    unused_qualifications
)]

//! UDS-over-ISO-TP diagnostic session core for Viessmann E3-series heating devices.
//!
//! This crate implements the per-device protocol state machine that drives
//! `ReadDataByIdentifier` (SID `0x22`) and `WriteDataByIdentifier` (SID `0x2E`,
//! plus a vendor-specific `0x77` variant) exchanges over single- and
//! multi-frame ISO-TP transport on a CAN bus, along with the command queue,
//! periodic scheduler, cool-down/timeout discipline, and DID decode pipeline
//! that sit around it.
//!
//! ## Scope
//!
//! This crate owns the protocol engine only. It does not ship a CAN driver,
//! does not read dictionary files from disk, and does not persist anything:
//! those are the embedding host's responsibility, reached through the
//! [`channel::CanChannel`] and [`sink::PublishSink`] trait contracts.
//!
//! ## Layout
//!
//! * [`channel`] — the CAN frame transport contract ("Frame I/O").
//! * [`catalog`] — the DID catalog: descriptors, writable set, versioned merge.
//! * [`codec`] — the closed registry of DID value codecs.
//! * [`sink`] — the decode sink: publishes raw/json/tree views and statistics.
//! * [`session`] — the ISO-TP/UDS session engine, command queue and scheduler.
//! * [`supervisor`] — owns sessions keyed by rx-ID and routes inbound frames.

use channel::ChannelError;

pub mod catalog;
pub mod channel;
pub mod codec;
pub mod helpers;
pub mod session;
pub mod sink;
pub mod supervisor;

/// Result type returned by fallible operations in this crate.
pub type DiagResult<T> = Result<T, DiagError>;

/// Crate-wide error type.
///
/// Mirrors the taxonomy from the session engine's error handling design:
/// protocol-layer failures (timeout, negative response, mismatch, malformed
/// frame) are reported through session callbacks and counted in
/// [`sink::Statistics`] rather than raised here. `DiagError` is reserved for
/// failures that cannot be attributed to a single exchange: a broken
/// transport, an invalid catalog, or a caller misusing the API.
#[derive(Debug)]
pub enum DiagError {
    /// The underlying CAN channel failed. Sessions affected by this are
    /// stopped; it does not get folded into per-exchange statistics.
    ChannelError(ChannelError),
    /// A catalog could not be merged (see [`catalog::CatalogError`]).
    CatalogError(catalog::CatalogError),
    /// A DID was referenced that has no known writable entry.
    DidNotWritable(u16),
    /// A write payload's length is unsupported by the protocol (zero length).
    EmptyPayload,
    /// The session is not running (`start()` was not called, or `stop()` was).
    SessionNotRunning,
}

impl std::fmt::Display for DiagError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiagError::ChannelError(e) => write!(f, "underlying channel error: {e}"),
            DiagError::CatalogError(e) => write!(f, "catalog error: {e}"),
            DiagError::DidNotWritable(did) => write!(f, "DID 0x{did:04X} is not writable"),
            DiagError::EmptyPayload => write!(f, "write payload must not be empty"),
            DiagError::SessionNotRunning => write!(f, "session is not running"),
        }
    }
}

impl std::error::Error for DiagError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DiagError::ChannelError(e) => Some(e),
            DiagError::CatalogError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ChannelError> for DiagError {
    fn from(e: ChannelError) -> Self {
        Self::ChannelError(e)
    }
}

impl From<catalog::CatalogError> for DiagError {
    fn from(e: catalog::CatalogError) -> Self {
        Self::CatalogError(e)
    }
}
