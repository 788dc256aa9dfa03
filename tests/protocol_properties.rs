//! Property tests for the round-trip laws and protocol invariants listed in
//! `SPEC_FULL.md` §8.

use std::collections::BTreeMap;

use proptest::prelude::*;

use e3oncan_core::channel::{CanId, ChannelResult};
use e3oncan_core::codec::{CodecKind, Value};
use e3oncan_core::helpers::{from_hex, to_hex};
use e3oncan_core::session::engine::{EngineAction, ProtocolEngine, SessionState, WriteVariant};
use e3oncan_core::session::DEFAULT_TIMEOUT;

fn noop_send(_id: CanId, _data: [u8; 8]) -> ChannelResult<()> {
    Ok(())
}

fn recording_send(sent: &mut Vec<(CanId, [u8; 8])>) -> impl FnMut(CanId, [u8; 8]) -> ChannelResult<()> + '_ {
    move |id, data| {
        sent.push((id, data));
        Ok(())
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        failure_persistence: None,
        .. ProptestConfig::default()
    })]

    // `to_hex ∘ from_hex` is identity on any even-length hex string made of
    // lower-case digits (the only form `to_hex` itself produces).
    #[test]
    fn hex_round_trips_on_arbitrary_bytes(bytes in prop::collection::vec(any::<u8>(), 0..64)) {
        let hex = to_hex(&bytes);
        prop_assert_eq!(from_hex(&hex), Some(bytes));
    }

    #[test]
    fn u8_codec_round_trips(n in any::<u8>()) {
        let args = BTreeMap::new();
        let decoded = CodecKind::U8.decode(&[n], &args).unwrap();
        let encoded = CodecKind::U8.encode(&decoded, &args).unwrap();
        prop_assert_eq!(encoded, vec![n]);
    }

    #[test]
    fn u16_be_codec_round_trips(hi in any::<u8>(), lo in any::<u8>()) {
        let args = BTreeMap::new();
        let bytes = vec![hi, lo];
        let decoded = CodecKind::U16Be.decode(&bytes, &args).unwrap();
        let encoded = CodecKind::U16Be.encode(&decoded, &args).unwrap();
        prop_assert_eq!(encoded, bytes);
    }

    #[test]
    fn i16_be_codec_round_trips(hi in any::<u8>(), lo in any::<u8>()) {
        let args = BTreeMap::new();
        let bytes = vec![hi, lo];
        let decoded = CodecKind::I16Be.decode(&bytes, &args).unwrap();
        let encoded = CodecKind::I16Be.encode(&decoded, &args).unwrap();
        prop_assert_eq!(encoded, bytes);
    }

    #[test]
    fn bcd_codec_round_trips(hi in 0u8..10, lo in 0u8..10, hi2 in 0u8..10, lo2 in 0u8..10) {
        let args = BTreeMap::new();
        let bytes = vec![(hi << 4) | lo, (hi2 << 4) | lo2];
        let decoded = CodecKind::Bcd.decode(&bytes, &args).unwrap();
        let encoded = CodecKind::Bcd.encode(&decoded, &args).unwrap();
        prop_assert_eq!(encoded, bytes);
    }

    // A write with payload length `n <= 4` always produces a Single Frame:
    // exactly one outbound frame, and the engine moves straight to
    // AwaitWriteAck without ever visiting AwaitWriteFC.
    #[test]
    fn short_write_sends_exactly_one_frame(n in 1usize..=4) {
        let payload: Vec<u8> = (0..n as u8).collect();
        let mut engine = ProtocolEngine::new(0x500, 0x510, DEFAULT_TIMEOUT);
        let mut sent = Vec::new();
        engine.begin_write(0x0100, &payload, WriteVariant::Standard, recording_send(&mut sent)).unwrap();
        prop_assert_eq!(sent.len(), 1);
        prop_assert_eq!(engine.state(), SessionState::AwaitWriteAck);
    }

    // A write with payload length `n > 4` sends a First Frame plus
    // `ceil((n - 3) / 7)` Consecutive Frames, with sequence counters
    // `0x21, 0x22, ...` wrapping `0x2F -> 0x20`.
    #[test]
    fn long_write_sends_ff_and_correctly_sequenced_cfs(n in 5usize..=200) {
        let payload: Vec<u8> = (0..n).map(|i| i as u8).collect();
        let mut engine = ProtocolEngine::new(0x500, 0x510, DEFAULT_TIMEOUT);
        let mut sent = Vec::new();
        engine.begin_write(0x0100, &payload, WriteVariant::Standard, recording_send(&mut sent)).unwrap();
        prop_assert_eq!(sent.len(), 1);
        prop_assert_eq!(engine.state(), SessionState::AwaitWriteFC);

        let fc = [0x30, 0x00, 0x00, 0, 0, 0, 0, 0];
        let mut cf_sent = Vec::new();
        let action = engine.on_inbound_frame(fc, recording_send(&mut cf_sent)).unwrap();
        prop_assert!(matches!(action, EngineAction::Continue));
        prop_assert_eq!(engine.state(), SessionState::AwaitWriteAck);

        let expected_cfs = ((n - 3) + 6) / 7; // ceil((n - 3) / 7)
        prop_assert_eq!(cf_sent.len(), expected_cfs);

        let mut expected_seq = 0x21u8;
        for (_, frame) in &cf_sent {
            prop_assert_eq!(frame[0], expected_seq);
            expected_seq = if expected_seq >= 0x2F { 0x20 } else { expected_seq + 1 };
        }
    }

    // Whatever trailing padding a device sends in its final Consecutive
    // Frame, a multi-frame read never delivers more than its declared
    // length.
    #[test]
    fn mf_read_truncates_to_declared_length(declared_len in 8u16..40, pad in any::<u8>()) {
        let mut engine = ProtocolEngine::new(0x500, 0x510, DEFAULT_TIMEOUT);
        let mut sent = Vec::new();
        engine.begin_read(0x0100, recording_send(&mut sent)).unwrap();

        let total_len = declared_len + 3;
        let ff = [
            0x10 | ((total_len >> 8) as u8 & 0x0F),
            (total_len & 0xFF) as u8,
            0x62, 0x01, 0x00,
            pad, pad, pad,
        ];
        let action = engine.on_inbound_frame(ff, noop_send).unwrap();
        prop_assert!(matches!(action, EngineAction::Continue));

        let mut delivered = 3usize; // the 3 content bytes the FF already carried
        let mut seq = 0x21u8;
        let mut last_action = EngineAction::Continue;
        while delivered < declared_len as usize {
            let cf = [seq, pad, pad, pad, pad, pad, pad, pad];
            last_action = engine.on_inbound_frame(cf, noop_send).unwrap();
            delivered += 7;
            seq = if seq >= 0x2F { 0x20 } else { seq + 1 };
        }

        match last_action {
            EngineAction::Completed { outcome, raw, .. } => {
                prop_assert_eq!(outcome, e3oncan_core::sink::Outcome::Ok);
                prop_assert_eq!(raw.unwrap().len(), declared_len as usize);
            }
            other => prop_assert!(false, "expected completion, got {other:?}"),
        }
        prop_assert!(engine.is_idle());
    }
}
