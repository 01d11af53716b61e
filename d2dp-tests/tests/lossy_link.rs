//! Recovery from lost DATA frames

use d2dp::{LinkError, RecvFlags, SendFlags, SessionOption};
use d2dp_tests::{fast_config, faulty_pair, pattern, Faults, RawPeer};
use std::thread;
use std::time::Duration;

#[test]
fn test_every_fifth_frame_dropped() {
    let faults = Faults {
        drop_every: 5,
        ..Faults::default()
    };
    let (a, link_a, b, _) = faulty_pair(faults, fast_config());
    let data = pattern(200_000);

    thread::scope(|s| {
        s.spawn(|| {
            for part in data.chunks(4096) {
                a.send(part, SendFlags::NONE).unwrap();
            }
        });

        b.set_option(SessionOption::RecvTimeout(20_000)).unwrap();
        let mut out = Vec::with_capacity(data.len());
        let mut buf = vec![0u8; 8192];
        while out.len() < data.len() {
            let n = b.recv(&mut buf, RecvFlags::NONE).unwrap();
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, data);
    });

    assert!(link_a.dropped() > 0);
    let stats = a.stats();
    assert!(stats.data_sent as usize >= link_a.data_frames());
    assert!(a.error().is_none());

    a.close().unwrap();
    b.close().unwrap();
}

#[test]
fn test_lost_hole_is_resent_after_sack() {
    let (session, mut peer) = RawPeer::connect(fast_config());
    let data = pattern(3 * 1456);
    session.send(&data, SendFlags::NONE).unwrap();

    // take the first transmission of all three frames
    let stream = peer.receive_stream(data.len(), Duration::from_secs(2));
    assert_eq!(stream, data);

    // report the middle frame missing
    let sack = d2dp::protocol::SackPair::new(
        d2dp::protocol::SeqId::new(2 * 1456),
        d2dp::protocol::SeqId::new(3 * 1456 - 1),
    );
    peer.send_ack(1456, false, vec![sack]);

    let resent = peer.collect_data(Duration::from_millis(300));
    assert!(resent.iter().any(|(seq, payload)| *seq == 1456
        && payload.as_slice() == &data[1456..2 * 1456]));

    // once everything is acknowledged the retransmission timer goes quiet
    peer.send_ack(3 * 1456, false, Vec::new());
    thread::sleep(Duration::from_millis(50));
    let _ = peer.collect_data(Duration::from_millis(50));
    assert!(peer.collect_data(Duration::from_millis(100)).is_empty());
}

#[test]
fn test_silent_peer_hits_retry_limit() {
    let config = fast_config()
        .with_rto_period(Duration::from_millis(10))
        .with_retry_limits(1, 3)
        .with_flush_timeout(Duration::from_millis(100));
    let (session, _peer) = RawPeer::connect(config);
    session.send(b"into the void", SendFlags::NONE).unwrap();

    let mut waited = Duration::ZERO;
    while session.error().is_none() && waited < Duration::from_secs(5) {
        thread::sleep(Duration::from_millis(10));
        waited += Duration::from_millis(10);
    }
    assert_eq!(session.error(), Some(LinkError::RetryLimit));

    let err = session.send(b"more", SendFlags::NONE).unwrap_err();
    assert!(matches!(err, d2dp::Error::Protocol(LinkError::RetryLimit)));
}
