use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use d2dp_protocol::header::{FrameHeader, SackPair};
use d2dp_protocol::params::{DATAGRAM_SIZE, HEADER_SIZE, MAX_PAYLOAD_SIZE};
use d2dp_protocol::rx_buffer::RxBuffer;
use d2dp_protocol::tx_buffer::TxBuffer;
use d2dp_protocol::wrap::SeqId;

fn sack_list(count: u32) -> Vec<SackPair> {
    (0..count)
        .map(|i| SackPair::new(SeqId::new(100 + i * 20), SeqId::new(109 + i * 20)))
        .collect()
}

fn bench_data_header_encode(c: &mut Criterion) {
    let header = FrameHeader::data(SeqId::new(1000), 42, MAX_PAYLOAD_SIZE as u16);
    let mut frame = [0u8; DATAGRAM_SIZE];

    c.bench_function("data_header_encode", |b| {
        b.iter(|| {
            let n = black_box(&header).encode(&mut frame).unwrap();
            black_box(n);
        });
    });
}

fn bench_data_header_decode(c: &mut Criterion) {
    let header = FrameHeader::data(SeqId::new(1000), 42, MAX_PAYLOAD_SIZE as u16);
    let mut frame = [0u8; DATAGRAM_SIZE];
    header.encode(&mut frame).unwrap();

    let mut group = c.benchmark_group("data_header_decode");
    group.throughput(Throughput::Bytes(DATAGRAM_SIZE as u64));
    group.bench_function("full_datagram", |b| {
        b.iter(|| {
            let decoded = FrameHeader::decode(black_box(&frame), MAX_PAYLOAD_SIZE).unwrap();
            black_box(decoded);
        });
    });
    group.finish();
}

fn bench_ack_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("ack_header");

    for count in [0u32, 10, 100] {
        let header = FrameHeader::ack(SeqId::new(50), 7, false, sack_list(count));
        let mut frame = vec![0u8; HEADER_SIZE + 8 * count as usize];

        group.bench_function(format!("encode_{}_pairs", count), |b| {
            b.iter(|| {
                let n = black_box(&header).encode(&mut frame).unwrap();
                black_box(n);
            });
        });

        header.encode(&mut frame).unwrap();
        group.bench_function(format!("decode_{}_pairs", count), |b| {
            b.iter(|| {
                let decoded = FrameHeader::decode(black_box(&frame), MAX_PAYLOAD_SIZE).unwrap();
                black_box(decoded);
            });
        });
    }

    group.finish();
}

fn bench_window_cycle(c: &mut Criterion) {
    let payload = vec![0xA5u8; 64 * 1024];
    let mut frame = vec![0u8; MAX_PAYLOAD_SIZE];
    let mut out = vec![0u8; payload.len()];

    let mut group = c.benchmark_group("window");
    group.throughput(Throughput::Bytes(payload.len() as u64));
    group.bench_function("append_send_ack_deliver_64k", |b| {
        b.iter(|| {
            let mut txb = TxBuffer::new(256 * 1024, MAX_PAYLOAD_SIZE).unwrap();
            let mut rxb = RxBuffer::new(256 * 1024, MAX_PAYLOAD_SIZE).unwrap();

            txb.append(&[payload.as_slice()], payload.len()).unwrap();
            while let Some(p) = txb.peek_next(&mut frame) {
                rxb.put(p.seq_id(), &frame[..p.len()]);
                txb.return_after_send(p).unwrap();
            }
            txb.process_ack(rxb.ack_id(), &[]);
            black_box(rxb.get(&mut out));
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_data_header_encode,
    bench_data_header_decode,
    bench_ack_roundtrip,
    bench_window_cycle
);
criterion_main!(benches);
