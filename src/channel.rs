//! Frame I/O: the CAN transport contract.
//!
//! This module deliberately knows nothing about ISO-TP or UDS. It describes
//! the one thing the session engine needs from the outside world: a way to
//! send an 8-byte CAN frame to a given 11-bit identifier. Inbound frames are
//! not polled by this crate — the embedding host owns the real read loop
//! against its CAN driver and pushes frames in through
//! [`crate::supervisor::Supervisor::on_inbound_frame`].
//!
//! No production CAN driver (socketCAN, J2534, SLCAN, ...) lives in this
//! crate; that is explicitly out of scope (see `SPEC_FULL.md` §1). The only
//! implementation shipped here is [`sim::SimulationChannel`], used by this
//! crate's own test suite the same way the teacher's `SimulationIsoTpChannel`
//! is used by its tests.

use std::fmt;

/// Result type for channel operations.
pub type ChannelResult<T> = Result<T, ChannelError>;

/// An 11-bit standard CAN identifier.
pub type CanId = u16;

/// Error produced by a CAN channel.
#[derive(Debug)]
pub enum ChannelError {
    /// Underlying I/O error reported by the host's driver.
    IoError(std::io::Error),
    /// The channel reported it is no longer open/reachable.
    InterfaceClosed,
    /// The host's driver rejected the frame (e.g. arbitration failure, bus-off).
    SendFailed(String),
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::IoError(e) => write!(f, "I/O error: {e}"),
            ChannelError::InterfaceClosed => write!(f, "CAN interface is closed"),
            ChannelError::SendFailed(desc) => write!(f, "frame send failed: {desc}"),
        }
    }
}

impl std::error::Error for ChannelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ChannelError::IoError(e) => Some(e),
            _ => None,
        }
    }
}

/// A single raw CAN frame: an 11-bit identifier and up to 8 data bytes.
///
/// Frames transmitted by the session engine are always 8 bytes; unused
/// tail bytes are irrelevant on read frames and `0x55` on SID-`0x77` write
/// frames (see `SPEC_FULL.md` §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    /// Standard 11-bit identifier. Extended (29-bit) IDs and RTR frames are
    /// out of scope.
    pub id: CanId,
    /// Frame payload, always 8 bytes long on the wire.
    pub data: [u8; 8],
}

impl CanFrame {
    /// Builds a new 8-byte frame for the given identifier.
    pub fn new(id: CanId, data: [u8; 8]) -> Self {
        Self { id, data }
    }
}

/// The Frame I/O contract: the one thing a session needs from the bus.
///
/// Implementors are shared across every session on the same physical bus
/// (`Arc<Mutex<dyn CanChannel>>`), so `send` must be quick and must not
/// itself block waiting on a response — ISO-TP and UDS semantics live
/// entirely above this trait, in [`crate::session`].
pub trait CanChannel: Send {
    /// Transmits a single 8-byte frame to `id`.
    fn send(&mut self, id: CanId, data: [u8; 8]) -> ChannelResult<()>;
}

pub mod sim {
    //! A simulation channel used only by this crate's own test suite.
    //!
    //! Mirrors the teacher repo's `SimulationIsoTpChannel` / `UdsSimEcu`
    //! pattern: outbound frames are recorded, and a test can either queue
    //! canned responses up front or drive inbound frames directly into a
    //! [`crate::supervisor::Supervisor`] after inspecting what was sent.

    use super::{CanChannel, CanFrame, ChannelResult};
    use std::sync::{Arc, Mutex};

    /// In-memory CAN channel that records every transmitted frame.
    #[derive(Debug, Clone, Default)]
    pub struct SimulationChannel {
        sent: Arc<Mutex<Vec<CanFrame>>>,
    }

    impl SimulationChannel {
        /// Creates an empty simulation channel.
        pub fn new() -> Self {
            Self::default()
        }

        /// Returns every frame sent so far, in send order.
        pub fn sent_frames(&self) -> Vec<CanFrame> {
            self.sent.lock().unwrap().clone()
        }

        /// Removes and returns the oldest unread sent frame, if any.
        pub fn pop_sent(&self) -> Option<CanFrame> {
            let mut g = self.sent.lock().unwrap();
            if g.is_empty() {
                None
            } else {
                Some(g.remove(0))
            }
        }

        /// Clears the recorded outbound frames.
        pub fn clear(&self) {
            self.sent.lock().unwrap().clear();
        }
    }

    impl CanChannel for SimulationChannel {
        fn send(&mut self, id: super::CanId, data: [u8; 8]) -> ChannelResult<()> {
            self.sent.lock().unwrap().push(CanFrame::new(id, data));
            Ok(())
        }
    }
}
