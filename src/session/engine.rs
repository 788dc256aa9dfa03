//! The ISO-TP / UDS protocol state machine for one logical device address
//! pair `(txId, rxId = txId + 0x10)` (`SPEC_FULL.md` §4.1).
//!
//! [`ProtocolEngine`] is pure protocol mechanics: framing, sequence
//! counters, timeout arming, and matching inbound frames against the
//! current [`SessionState`]. It knows nothing about the command queue, the
//! decode sink, or cross-session retry wiring — those live in
//! [`super`] and are driven by the [`EngineAction`] this engine returns.

use std::time::{Duration, Instant};

use crate::channel::{CanId, ChannelResult};
use crate::sink::Outcome;

/// SID for ReadDataByIdentifier requests.
const SID_READ_REQ: u8 = 0x22;
/// SID for ReadDataByIdentifier positive replies.
const SID_READ_RESP: u8 = 0x62;
/// SID for WriteDataByIdentifier requests.
const SID_WRITE_REQ: u8 = 0x2E;
/// SID for WriteDataByIdentifier positive replies.
const SID_WRITE_RESP: u8 = 0x6E;
/// Negative-response SID.
const SID_NEGATIVE: u8 = 0x7F;
/// Vendor SID-0x77 completion marker, at `data[4]` of the ack frame.
const VENDOR77_COMPLETION_MARKER: u8 = 0x44;
/// Flow-control frame sent by the receiver of a multi-frame transfer.
const FLOW_CONTROL_FRAME: [u8; 8] = [0x30, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
/// First sequence counter value of a multi-frame transfer.
const SEQ_START: u8 = 0x21;
/// Sequence counter wraps from `0x2F` back to `0x20` (`SPEC_FULL.md` §3).
const SEQ_WRAP_FROM: u8 = 0x2F;
const SEQ_WRAP_TO: u8 = 0x20;
/// Default cool-down by outcome (`SPEC_FULL.md` §4.1 / §7).
const COOLDOWN_OK: Duration = Duration::from_millis(0);
const COOLDOWN_NEGATIVE_RESPONSE: Duration = Duration::from_millis(100);
const COOLDOWN_DID_MISMATCH: Duration = Duration::from_millis(1000);
const COOLDOWN_BAD: Duration = Duration::from_millis(2500);
/// Default exchange timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(7500);
/// Default consecutive-frame separation time, used whenever the device's
/// flow-control frame names one outside `[20, 127]` (`SPEC_FULL.md` §4.1,
/// §9 open question — `0` is treated as "outside the valid range" rather
/// than "no pacing", so it also falls back to this default).
const DEFAULT_SEPARATION_TIME: Duration = Duration::from_millis(50);

/// The session's current place in the SF/FF/CF/FC protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No exchange in flight.
    Idle,
    /// A read request was sent; waiting for the SF or FF reply.
    AwaitReadHead,
    /// A multi-frame read's First Frame arrived; waiting for consecutive frames.
    AwaitReadCF,
    /// A write's First Frame was sent; waiting for the device's flow-control frame.
    AwaitWriteFC,
    /// A write was fully transmitted; waiting for the positive/negative ack.
    AwaitWriteAck,
}

/// Which write encoding an in-flight write exchange is using.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteVariant {
    /// Default `WriteDataByIdentifier` (SID `0x2E`).
    Standard,
    /// The vendor `0x77` encapsulated variant.
    Vendor77,
}

#[derive(Debug, Clone)]
struct TransferBuffer {
    did: u16,
    expected_len: u16,
    bytes: Vec<u8>,
    seq_counter: u8,
    remaining_to_send: Vec<u8>,
    write_variant: WriteVariant,
    started_at: Instant,
    /// The payload a write exchange was started with, so a failed write can
    /// be retried (e.g. the SID-0x77 fallback on negative response) without
    /// the caller having to remember it separately. Empty for reads.
    write_payload: Vec<u8>,
}

/// What the caller should do after feeding the engine a frame or a timeout
/// check.
#[derive(Debug)]
pub enum EngineAction {
    /// The exchange concluded. `raw` carries the decoded-ready payload only
    /// for a successful read; every other outcome (and every write) leaves
    /// it `None`.
    Completed {
        /// How the exchange ended.
        outcome: Outcome,
        /// The DID this exchange was about.
        did: u16,
        /// Raw bytes ready for the decode sink, for `Outcome::Ok` reads only.
        raw: Option<Vec<u8>>,
        /// Minimum wait before the next exchange may start.
        cooldown: Duration,
        /// Wall-clock time from request to this reply, for `Outcome::Ok` only.
        reply_time_ms: Option<u64>,
        /// The payload this exchange wrote, if it was a write. Carried back
        /// so a negative response can be retried with the same bytes.
        write_payload: Option<Vec<u8>>,
    },
    /// The frame was consumed but the exchange is still in flight.
    Continue,
    /// The frame didn't belong to this exchange at all (e.g. a stray
    /// SID-0x77 frame from another client) and was silently ignored.
    Ignored,
}

/// Pads `content` up to `total_len` bytes with `pad_byte`, assuming
/// `content.len() <= total_len`.
fn padded(mut content: Vec<u8>, total_len: usize, pad_byte: u8) -> Vec<u8> {
    content.resize(total_len, pad_byte);
    content
}

enum FramingPlan {
    Single([u8; 8]),
    Multi {
        first_frame: [u8; 8],
        remaining: Vec<u8>,
    },
}

/// Lays `content` (already padded to its intended total length) out as
/// either one Single Frame or a First Frame plus leftover bytes for
/// consecutive frames, per the generic ISO-TP 7/6-byte split.
fn frame_payload(content: &[u8], pad_byte: u8) -> FramingPlan {
    if content.len() <= 7 {
        let mut data = [pad_byte; 8];
        data[0] = content.len() as u8;
        data[1..1 + content.len()].copy_from_slice(content);
        FramingPlan::Single(data)
    } else {
        let len = content.len() as u16;
        let mut data = [pad_byte; 8];
        data[0] = 0x10 | ((len >> 8) as u8 & 0x0F);
        data[1] = (len & 0xFF) as u8;
        let take = content.len().min(6);
        data[2..2 + take].copy_from_slice(&content[..take]);
        FramingPlan::Multi {
            first_frame: data,
            remaining: content[take..].to_vec(),
        }
    }
}

fn wrap_seq(seq: u8) -> u8 {
    if seq > SEQ_WRAP_FROM {
        SEQ_WRAP_TO
    } else {
        seq
    }
}

fn separation_time(st_byte: u8) -> Duration {
    if (20..=127).contains(&st_byte) {
        Duration::from_millis(st_byte as u64)
    } else {
        DEFAULT_SEPARATION_TIME
    }
}

/// The protocol engine for one session: owns the [`SessionState`] and the
/// in-flight [`TransferBuffer`], if any.
#[derive(Debug)]
pub struct ProtocolEngine {
    tx_id: CanId,
    rx_id: CanId,
    timeout: Duration,
    state: SessionState,
    buffer: Option<TransferBuffer>,
}

impl ProtocolEngine {
    /// Creates an idle engine for the given tx/rx identifier pair.
    pub fn new(tx_id: CanId, rx_id: CanId, timeout: Duration) -> Self {
        Self {
            tx_id,
            rx_id,
            timeout,
            state: SessionState::Idle,
            buffer: None,
        }
    }

    /// The identifier this engine listens for inbound frames on.
    pub fn rx_id(&self) -> CanId {
        self.rx_id
    }

    /// The current protocol state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// True if no exchange is in flight.
    pub fn is_idle(&self) -> bool {
        self.state == SessionState::Idle
    }

    /// Starts a read exchange for `did`, transmitting the SF request.
    pub fn begin_read(
        &mut self,
        did: u16,
        mut send: impl FnMut(CanId, [u8; 8]) -> ChannelResult<()>,
    ) -> ChannelResult<()> {
        let content = [SID_READ_REQ, (did >> 8) as u8, did as u8];
        let mut data = [0u8; 8];
        data[0] = content.len() as u8;
        data[1..1 + content.len()].copy_from_slice(&content);
        send(self.tx_id, data)?;
        self.buffer = Some(TransferBuffer {
            did,
            expected_len: 0,
            bytes: Vec::new(),
            seq_counter: SEQ_START,
            remaining_to_send: Vec::new(),
            write_variant: WriteVariant::Standard,
            started_at: Instant::now(),
            write_payload: Vec::new(),
        });
        self.state = SessionState::AwaitReadHead;
        Ok(())
    }

    /// Starts a write exchange for `did`, transmitting either an SF or the
    /// first frame of a multi-frame transfer, depending on encoding and
    /// payload length.
    pub fn begin_write(
        &mut self,
        did: u16,
        payload: &[u8],
        variant: WriteVariant,
        mut send: impl FnMut(CanId, [u8; 8]) -> ChannelResult<()>,
    ) -> ChannelResult<()> {
        let n = payload.len();
        let (content, pad_byte) = match variant {
            WriteVariant::Standard => {
                let mut c = vec![SID_WRITE_REQ, (did >> 8) as u8, did as u8];
                c.extend_from_slice(payload);
                (c, 0u8)
            }
            WriteVariant::Vendor77 => {
                let mut c = vec![0x43, 0x01, 0x82, did as u8, (did >> 8) as u8, 0xB0 + n as u8];
                c.extend_from_slice(payload);
                let total_len = (n + 6) + 3;
                (padded(c, total_len, 0x55), 0x55u8)
            }
        };

        match frame_payload(&content, pad_byte) {
            FramingPlan::Single(data) => {
                send(self.tx_id, data)?;
                self.buffer = Some(TransferBuffer {
                    did,
                    expected_len: 0,
                    bytes: Vec::new(),
                    seq_counter: SEQ_START,
                    remaining_to_send: Vec::new(),
                    write_variant: variant,
                    started_at: Instant::now(),
                    write_payload: payload.to_vec(),
                });
                self.state = SessionState::AwaitWriteAck;
            }
            FramingPlan::Multi {
                first_frame,
                remaining,
            } => {
                send(self.tx_id, first_frame)?;
                self.buffer = Some(TransferBuffer {
                    did,
                    expected_len: 0,
                    bytes: Vec::new(),
                    seq_counter: SEQ_START,
                    remaining_to_send: remaining,
                    write_variant: variant,
                    started_at: Instant::now(),
                    write_payload: payload.to_vec(),
                });
                self.state = SessionState::AwaitWriteFC;
            }
        }
        Ok(())
    }

    fn finish(&mut self, outcome: Outcome, did: u16, raw: Option<Vec<u8>>, cooldown: Duration) -> EngineAction {
        let reply_time_ms = if outcome == Outcome::Ok {
            self.buffer
                .as_ref()
                .map(|b| b.started_at.elapsed().as_millis() as u64)
        } else {
            None
        };
        let write_payload = self
            .buffer
            .as_ref()
            .filter(|b| !b.write_payload.is_empty())
            .map(|b| b.write_payload.clone());
        self.buffer = None;
        self.state = SessionState::Idle;
        EngineAction::Completed {
            outcome,
            did,
            raw,
            cooldown,
            reply_time_ms,
            write_payload,
        }
    }

    /// Feeds one inbound frame (already routed to this engine's `rx_id` by
    /// the caller) into the state machine.
    pub fn on_inbound_frame(
        &mut self,
        data: [u8; 8],
        mut send: impl FnMut(CanId, [u8; 8]) -> ChannelResult<()>,
    ) -> ChannelResult<EngineAction> {
        match self.state {
            SessionState::Idle => Ok(EngineAction::Ignored),
            SessionState::AwaitReadHead => Ok(self.on_read_head(data)),
            SessionState::AwaitReadCF => Ok(self.on_read_cf(data)),
            SessionState::AwaitWriteFC => self.on_write_fc(data, &mut send),
            SessionState::AwaitWriteAck => Ok(self.on_write_ack(data)),
        }
    }

    fn on_read_head(&mut self, data: [u8; 8]) -> EngineAction {
        let did = self.buffer.as_ref().map(|b| b.did).unwrap_or(0);
        if data[0] == 0x03 && data[1] == SID_NEGATIVE && data[2] == SID_READ_REQ {
            return self.finish(Outcome::NegativeResponse, did, None, COOLDOWN_NEGATIVE_RESPONSE);
        }
        if (data[0] >> 4) == 0 && data[1] == SID_READ_RESP {
            let declared_len = data[0].saturating_sub(3) as u16;
            let did_rx = (u16::from(data[2]) << 8) | u16::from(data[3]);
            if did_rx != did {
                return self.finish(Outcome::DidMismatch, did, None, COOLDOWN_DID_MISMATCH);
            }
            let end = (4 + declared_len as usize).min(8);
            let payload: Vec<u8> = data[4..end].to_vec();
            return self.finish(Outcome::Ok, did, Some(payload), COOLDOWN_OK);
        }
        if (data[0] >> 4) == 1 && data[2] == SID_READ_RESP {
            let total_len = ((u16::from(data[0] & 0x0F)) << 8 | u16::from(data[1])).saturating_sub(3);
            let did_rx = (u16::from(data[3]) << 8) | u16::from(data[4]);
            if did_rx != did {
                return self.finish(Outcome::DidMismatch, did, None, COOLDOWN_DID_MISMATCH);
            }
            if let Some(buffer) = self.buffer.as_mut() {
                buffer.expected_len = total_len;
                buffer.bytes = data[5..8].to_vec();
                buffer.seq_counter = SEQ_START;
            }
            self.state = SessionState::AwaitReadCF;
            return EngineAction::Continue;
        }
        self.finish(Outcome::BadFrame, did, None, COOLDOWN_BAD)
    }

    fn on_read_cf(&mut self, data: [u8; 8]) -> EngineAction {
        let did = self.buffer.as_ref().map(|b| b.did).unwrap_or(0);
        let expected_seq = self.buffer.as_ref().map(|b| b.seq_counter).unwrap_or(SEQ_START);
        if (data[0] >> 4) != 2 || data[0] != expected_seq {
            return self.finish(Outcome::BadFrame, did, None, COOLDOWN_BAD);
        }
        let buffer = self.buffer.as_mut().expect("AwaitReadCF always has a buffer");
        buffer.bytes.extend_from_slice(&data[1..8]);
        buffer.seq_counter = wrap_seq(buffer.seq_counter + 1);
        if buffer.bytes.len() >= buffer.expected_len as usize {
            let mut raw = std::mem::take(&mut buffer.bytes);
            raw.truncate(buffer.expected_len as usize);
            return self.finish(Outcome::Ok, did, Some(raw), COOLDOWN_OK);
        }
        EngineAction::Continue
    }

    fn on_write_fc(
        &mut self,
        data: [u8; 8],
        send: &mut impl FnMut(CanId, [u8; 8]) -> ChannelResult<()>,
    ) -> ChannelResult<EngineAction> {
        let did = self.buffer.as_ref().map(|b| b.did).unwrap_or(0);
        if data[0] != 0x30 || data[1] != 0x00 {
            return Ok(self.finish(Outcome::BadFrame, did, None, COOLDOWN_BAD));
        }
        let st = separation_time(data[2]);
        let (remaining, variant) = {
            let buffer = self.buffer.as_ref().expect("AwaitWriteFC always has a buffer");
            (buffer.remaining_to_send.clone(), buffer.write_variant)
        };
        let pad_byte = match variant {
            WriteVariant::Standard => 0u8,
            WriteVariant::Vendor77 => 0x55u8,
        };
        let mut seq = SEQ_START;
        for (i, chunk) in remaining.chunks(7).enumerate() {
            let mut frame = [pad_byte; 8];
            frame[0] = seq;
            frame[1..1 + chunk.len()].copy_from_slice(chunk);
            send(self.tx_id, frame)?;
            seq = wrap_seq(seq + 1);
            if i + 1 < remaining.chunks(7).len() {
                std::thread::sleep(st);
            }
        }
        if let Some(buffer) = self.buffer.as_mut() {
            buffer.remaining_to_send.clear();
        }
        self.state = SessionState::AwaitWriteAck;
        Ok(EngineAction::Continue)
    }

    fn on_write_ack(&mut self, data: [u8; 8]) -> EngineAction {
        let (did, variant) = self
            .buffer
            .as_ref()
            .map(|b| (b.did, b.write_variant))
            .unwrap_or((0, WriteVariant::Standard));
        match variant {
            WriteVariant::Standard => {
                if data[0] == 0x03 && data[1] == SID_NEGATIVE && data[2] == SID_WRITE_REQ {
                    return self.finish(Outcome::NegativeResponse, did, None, COOLDOWN_NEGATIVE_RESPONSE);
                }
                let did_rx = (u16::from(data[2]) << 8) | u16::from(data[3]);
                if data[0] == 0x03 && data[1] == SID_WRITE_RESP && did_rx == did {
                    return self.finish(Outcome::Ok, did, None, COOLDOWN_OK);
                }
                self.finish(Outcome::BadFrame, did, None, COOLDOWN_BAD)
            }
            WriteVariant::Vendor77 => {
                if data[0] == 0x04 && data[4] == VENDOR77_COMPLETION_MARKER {
                    self.finish(Outcome::Ok, did, None, COOLDOWN_OK)
                } else {
                    // A SID-0x77 frame on the bus that isn't our completion
                    // marker belongs to an unrelated client; ignore it
                    // rather than failing our own exchange.
                    EngineAction::Ignored
                }
            }
        }
    }

    /// Checks whether the in-flight exchange, if any, has exceeded its
    /// timeout as of `now`.
    pub fn check_timeout(&mut self, now: Instant) -> EngineAction {
        match &self.buffer {
            Some(buffer) if now.duration_since(buffer.started_at) >= self.timeout => {
                let did = buffer.did;
                self.finish(Outcome::Timeout, did, None, COOLDOWN_OK)
            }
            _ => EngineAction::Continue,
        }
    }
}
