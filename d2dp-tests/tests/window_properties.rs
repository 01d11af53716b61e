//! Property-based tests for the send and receive windows

use d2dp_protocol::{RxBuffer, RxPut, SackPair, SeqId, TxBuffer};
use proptest::prelude::*;

const ELEM: usize = 100;

fn stream(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 253) as u8).collect()
}

/// Drain every frame the send window is willing to transmit
fn transmit_all(tx: &mut TxBuffer) -> Vec<(SeqId, Vec<u8>)> {
    let mut frames = Vec::new();
    let mut out = vec![0u8; tx.elem_size()];
    while let Some(peeked) = tx.peek_next(&mut out) {
        frames.push((peeked.seq_id(), out[..peeked.len()].to_vec()));
        tx.return_after_send(peeked).unwrap();
    }
    frames
}

proptest! {
    #[test]
    fn prop_any_arrival_order_reassembles(
        start in any::<u32>(),
        len in 1usize..4000,
        order in prop::collection::vec(any::<prop::sample::Index>(), 64),
        dups in prop::collection::vec(any::<prop::sample::Index>(), 0..8),
    ) {
        let data = stream(len);
        let start = SeqId::new(start);
        let mut tx = TxBuffer::with_start(8 * 1024, ELEM, start).unwrap();
        tx.append(&[data.as_slice()], data.len()).unwrap();
        let mut frames = transmit_all(&mut tx);

        // shuffle by repeated swaps
        for (i, index) in order.iter().enumerate() {
            let a = i % frames.len();
            let b = index.index(frames.len());
            frames.swap(a, b);
        }
        let duplicates: Vec<_> = dups.iter().map(|i| frames[i.index(frames.len())].clone()).collect();

        let mut rx = RxBuffer::with_start(8 * 1024, ELEM, start).unwrap();
        for (seq, payload) in &frames {
            prop_assert_eq!(rx.put(*seq, payload), RxPut::Ok);
        }
        for (seq, payload) in &duplicates {
            prop_assert_eq!(rx.put(*seq, payload), RxPut::Duplicate);
        }

        prop_assert!(rx.generate_sack_pairs(100).is_empty());
        prop_assert!(rx.ack_id().eq(start + len as u32));

        let mut out = vec![0u8; len];
        prop_assert_eq!(rx.get(&mut out), len);
        prop_assert_eq!(out, data);

        // acknowledging the whole stream empties the send window
        let outstanding = tx.len();
        prop_assert_eq!(tx.process_ack(rx.ack_id(), &[]), outstanding);
        prop_assert!(tx.is_empty());
    }

    #[test]
    fn prop_sack_pairs_describe_gaps(
        present in prop::collection::vec(any::<bool>(), 1..40),
    ) {
        let mut rx = RxBuffer::new(8 * 1024, ELEM).unwrap();
        for (i, keep) in present.iter().enumerate() {
            if *keep {
                let seq = SeqId::new((i * ELEM) as u32);
                prop_assert_eq!(rx.put(seq, &[i as u8; ELEM]), RxPut::Ok);
            }
        }

        let prefix = present.iter().take_while(|p| **p).count();
        prop_assert!(rx.ack_id().eq(SeqId::new((prefix * ELEM) as u32)));

        // rebuild the runs after the prefix
        let mut expected = Vec::new();
        let mut i = prefix;
        while i < present.len() {
            if present[i] {
                let left = i;
                while i < present.len() && present[i] {
                    i += 1;
                }
                expected.push(SackPair::new(
                    SeqId::new((left * ELEM) as u32),
                    SeqId::new((i * ELEM - 1) as u32),
                ));
            } else {
                i += 1;
            }
        }
        prop_assert_eq!(rx.generate_sack_pairs(100), expected);
    }

    #[test]
    fn prop_sack_frees_only_reported_nodes(
        present in prop::collection::vec(any::<bool>(), 1..40),
    ) {
        let data = stream(present.len() * ELEM);
        let mut tx = TxBuffer::new(8 * 1024, ELEM).unwrap();
        tx.append(&[data.as_slice()], data.len()).unwrap();
        let frames = transmit_all(&mut tx);
        prop_assert_eq!(frames.len(), present.len());

        let mut rx = RxBuffer::new(8 * 1024, ELEM).unwrap();
        for ((seq, payload), keep) in frames.iter().zip(&present) {
            if *keep {
                rx.put(*seq, payload);
            }
        }

        let received = present.iter().filter(|p| **p).count();
        let freed = tx.process_ack(rx.ack_id(), &rx.generate_sack_pairs(100));
        prop_assert_eq!(freed, received);
        prop_assert_eq!(tx.len(), present.len() - received);

        // holes the receiver can see are exactly what gets sent again
        let resent: Vec<u32> = transmit_all(&mut tx).iter().map(|(s, _)| s.as_raw()).collect();
        let last_received = present.iter().rposition(|p| *p).unwrap_or(0);
        let holes: Vec<u32> = present
            .iter()
            .enumerate()
            .filter(|(i, p)| !**p && *i < last_received)
            .map(|(i, _)| (i * ELEM) as u32)
            .collect();
        prop_assert_eq!(resent, holes);
    }
}
