//! Property tests for the streaming frame codec
//!
//! These cover the invariants the session layer depends on:
//! - Gain reads survive encode/decode for every valid channel
//! - Raw levels decode to exactly raw / 10
//! - Splitting a frame across reads never changes the result
//! - A garbled frame in front of a valid one yields only the valid one

use amp_protocol::frame::SENTINEL;
use amp_protocol::{
    ChannelKind, Command, CommandCodec, EncodeFrame, Level, MuteTarget, ProtocolCodec, Response,
    ResponseCodec,
};
use proptest::prelude::*;

fn channel_kind() -> impl Strategy<Value = ChannelKind> {
    prop_oneof![Just(ChannelKind::Input), Just(ChannelKind::Output)]
}

fn mute_target() -> impl Strategy<Value = MuteTarget> {
    prop_oneof![
        Just(MuteTarget::Master),
        (channel_kind(), 1u8..=4).prop_map(|(kind, channel)| MuteTarget::channel(kind, channel)),
    ]
}

fn response() -> impl Strategy<Value = Response> {
    prop_oneof![
        (channel_kind(), 1u8..=4, any::<i16>()).prop_map(|(kind, channel, raw)| {
            Response::Gain {
                kind,
                channel,
                level: Level::from_raw(raw),
            }
        }),
        (mute_target(), any::<bool>()).prop_map(|(target, muted)| Response::Mute { target, muted }),
    ]
}

/// Split `data` at the given (sorted, deduplicated) cut points
fn split_at_points(data: &[u8], mut cuts: Vec<usize>) -> Vec<Vec<u8>> {
    cuts.retain(|&c| c > 0 && c < data.len());
    cuts.sort_unstable();
    cuts.dedup();

    let mut chunks = Vec::new();
    let mut start = 0;
    for cut in cuts {
        chunks.push(data[start..cut].to_vec());
        start = cut;
    }
    chunks.push(data[start..].to_vec());
    chunks
}

proptest! {
    #[test]
    fn gain_read_roundtrip(kind in channel_kind(), channel in 1u8..=4) {
        let cmd = Command::ReadGain { kind, channel };
        let mut codec = CommandCodec::new();
        codec.push_bytes(&cmd.encode());
        prop_assert_eq!(codec.next_frame(), Some(cmd));
    }

    #[test]
    fn gain_response_decodes_exact_db(
        raw in any::<i16>(),
        kind in channel_kind(),
        channel in 1u8..=4,
    ) {
        let frame = Response::Gain { kind, channel, level: Level::from_raw(raw) }.encode();
        let mut codec = ResponseCodec::new();
        codec.push_bytes(&frame);

        match codec.next_frame() {
            Some(Response::Gain { level, .. }) => {
                prop_assert_eq!(level.raw(), raw);
                prop_assert_eq!(level.db(), f64::from(raw) / 10.0);
            }
            other => prop_assert!(false, "unexpected decode result {:?}", other),
        }
    }

    #[test]
    fn fragmentation_invariance(
        responses in prop::collection::vec(response(), 1..5),
        cuts in prop::collection::vec(0usize..64, 0..12),
    ) {
        let stream: Vec<u8> = responses.iter().flat_map(|r| r.encode()).collect();

        let mut codec = ResponseCodec::new();
        let mut decoded = Vec::new();
        for chunk in split_at_points(&stream, cuts) {
            codec.push_bytes(&chunk);
            decoded.extend(std::iter::from_fn(|| codec.next_frame()));
        }

        prop_assert_eq!(decoded, responses);
        prop_assert_eq!(codec.buffered(), 0);
    }

    #[test]
    fn garbled_frame_then_valid_frame_yields_one(
        garbage in prop::collection::vec(any::<u8>(), 0..24),
        valid in response(),
    ) {
        // A frame whose trailer is broken, followed by a good one
        prop_assume!(!garbage.contains(&amp_protocol::frame::TRAILER));
        let mut garbled = SENTINEL.to_vec();
        garbled.extend_from_slice(&garbage);
        garbled.push(0x00);
        prop_assume!(amp_protocol::frame::find_sentinel(&garbled[1..]).is_none());

        let mut stream = garbled.clone();
        stream.extend(valid.encode());

        let mut codec = ResponseCodec::new();
        codec.push_bytes(&stream);
        let decoded: Vec<_> = std::iter::from_fn(|| codec.next_frame()).collect();

        prop_assert_eq!(decoded, vec![valid]);
        prop_assert_eq!(codec.buffered(), 0);
        prop_assert_eq!(codec.stats().discarded_bytes, garbled.len() as u64);
    }
}
