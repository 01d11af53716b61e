//! Property-based tests for the frame header codec

use d2dp_protocol::params::{HEADER_SIZE, MAX_PAYLOAD_SIZE, MAX_SACK_PAIRS, SACK_PAIR_SIZE};
use d2dp_protocol::{FrameHeader, FrameKind, HeaderError, SackPair, SeqId};
use proptest::prelude::*;

/// Ordered, non-adjacent SACK pairs strictly after `cumulative`
fn sack_strategy(cumulative: u32) -> impl Strategy<Value = Vec<SackPair>> {
    prop::collection::vec((1u32..1000, 0u32..1000), 0..=MAX_SACK_PAIRS).prop_map(move |steps| {
        let mut floor = SeqId::new(cumulative);
        steps
            .into_iter()
            .map(|(gap, width)| {
                let left = floor + gap;
                let right = left + width;
                floor = right + 1;
                SackPair::new(left, right)
            })
            .collect()
    })
}

fn ack_strategy() -> impl Strategy<Value = FrameHeader> {
    (any::<u32>(), any::<u64>(), any::<bool>())
        .prop_flat_map(|(cumulative, packet_id, suspend)| {
            sack_strategy(cumulative).prop_map(move |sacks| {
                FrameHeader::ack(SeqId::new(cumulative), packet_id, suspend, sacks)
            })
        })
}

proptest! {
    #[test]
    fn prop_data_frames_decode(
        seq in any::<u32>(),
        packet_id in any::<u64>(),
        payload in prop::collection::vec(any::<u8>(), 1..=MAX_PAYLOAD_SIZE),
    ) {
        let header = FrameHeader::data(SeqId::new(seq), packet_id, payload.len() as u16);
        let mut frame = vec![0u8; HEADER_SIZE + payload.len()];
        let n = header.encode(&mut frame).unwrap();
        prop_assert_eq!(n, HEADER_SIZE);
        frame[n..].copy_from_slice(&payload);

        let (decoded, consumed) = FrameHeader::decode(&frame, MAX_PAYLOAD_SIZE).unwrap();
        prop_assert_eq!(consumed, HEADER_SIZE);
        prop_assert_eq!(&decoded, &header);
        prop_assert_eq!(&frame[consumed..], payload.as_slice());
    }

    #[test]
    fn prop_ack_frames_decode(header in ack_strategy()) {
        let mut frame = vec![0u8; header.encoded_len()];
        let n = header.encode(&mut frame).unwrap();
        prop_assert_eq!(n, frame.len());

        let (decoded, consumed) = FrameHeader::decode(&frame, MAX_PAYLOAD_SIZE).unwrap();
        prop_assert_eq!(consumed, frame.len());
        prop_assert_eq!(decoded, header);
    }

    #[test]
    fn prop_truncated_ack_rejected(header in ack_strategy(), cut in 1usize..SACK_PAIR_SIZE) {
        let mut frame = vec![0u8; header.encoded_len()];
        header.encode(&mut frame).unwrap();
        let short = frame.len().saturating_sub(cut).max(1);
        prop_assert!(FrameHeader::decode(&frame[..short], MAX_PAYLOAD_SIZE).is_err());
    }

    #[test]
    fn prop_decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..1600)) {
        let _ = FrameHeader::decode(&bytes, MAX_PAYLOAD_SIZE);
    }

    #[test]
    fn prop_data_length_must_match(
        declared in 1u16..=MAX_PAYLOAD_SIZE as u16,
        actual in 0usize..=MAX_PAYLOAD_SIZE,
    ) {
        prop_assume!(declared as usize != actual);
        let header = FrameHeader::data(SeqId::new(0), 1, declared);
        let mut frame = vec![0u8; HEADER_SIZE + actual];
        header.encode(&mut frame).unwrap();

        let is_mismatch = matches!(
            FrameHeader::decode(&frame, MAX_PAYLOAD_SIZE),
            Err(HeaderError::LengthMismatch { .. })
        );
        prop_assert!(is_mismatch);
    }
}

#[test]
fn test_swapped_sack_pairs_rejected() {
    let sacks = vec![
        SackPair::new(SeqId::new(300), SeqId::new(400)),
        SackPair::new(SeqId::new(100), SeqId::new(200)),
    ];
    let header = FrameHeader::ack(SeqId::new(50), 7, false, sacks);
    let mut frame = vec![0u8; header.encoded_len()];
    header.encode(&mut frame).unwrap();

    assert_eq!(
        FrameHeader::decode(&frame, MAX_PAYLOAD_SIZE),
        Err(HeaderError::SackOrder { index: 1 })
    );
}

#[test]
fn test_sacks_across_wrap() {
    let sacks = vec![
        SackPair::new(SeqId::new(u32::MAX - 10), SeqId::new(u32::MAX)),
        SackPair::new(SeqId::new(5), SeqId::new(9)),
    ];
    let header = FrameHeader::ack(SeqId::new(u32::MAX - 100), 1, true, sacks);
    let mut frame = vec![0u8; header.encoded_len()];
    header.encode(&mut frame).unwrap();

    let (decoded, _) = FrameHeader::decode(&frame, MAX_PAYLOAD_SIZE).unwrap();
    match decoded.kind {
        FrameKind::Ack { suspend, sacks } => {
            assert!(suspend);
            assert_eq!(sacks.len(), 2);
        }
        FrameKind::Data { .. } => panic!("decoded as data"),
    }
}
