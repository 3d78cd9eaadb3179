//! Framing, stuffing and decoding benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tidewire_protocol::codec::{CodecConfig, DEFAULT_DECODER_CAPACITY, MAX_FRAME_BODY};
use tidewire_protocol::{
    BufferPool, CompressionMode, FrameDecoder, FrameEncoder, OutboundMessage, PayloadCodec,
    RingBuffer, MAX_MESSAGE_SIZE,
};

fn payload(size: usize) -> Vec<u8> {
    // Mix of zeros and text so stuffing has work to do.
    (0..size)
        .map(|i| if i % 37 == 0 { 0 } else { b'a' + (i % 26) as u8 })
        .collect()
}

fn encoder(mode: CompressionMode) -> FrameEncoder {
    FrameEncoder::new(
        CodecConfig::default().with_compression(mode, 1024),
        BufferPool::default(),
    )
}

fn bench_payload_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("payload_encode");

    for size in [100, 1000, 10000, 60000] {
        let data = payload(size);
        let mut out = Vec::with_capacity(PayloadCodec::encoded_len_bound(size));

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| {
                out.clear();
                PayloadCodec::encode_into(&[data.as_slice()], &mut out);
                black_box(out.len())
            });
        });
    }

    group.finish();
}

fn bench_payload_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("payload_decode");

    for size in [100, 1000, 10000, 60000] {
        let encoded = PayloadCodec::encode(&payload(size));
        let stuffed = encoded[..encoded.len() - 1].to_vec();
        let mut out = Vec::with_capacity(size + 4);

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &stuffed, |b, stuffed| {
            b.iter(|| {
                out.clear();
                black_box(PayloadCodec::decode(stuffed, &mut out).unwrap())
            });
        });
    }

    group.finish();
}

fn bench_frame_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_encode");

    for (name, mode) in [("plain", CompressionMode::None), ("lz4", CompressionMode::Lz4)] {
        let encoder = encoder(mode);
        for size in [100, 10000, 200000] {
            let data = payload(size);

            group.throughput(Throughput::Bytes(size as u64));
            group.bench_with_input(BenchmarkId::new(name, size), &data, |b, data| {
                b.iter(|| {
                    black_box(
                        encoder
                            .encode(&OutboundMessage::command(1, data), MAX_FRAME_BODY)
                            .unwrap(),
                    )
                });
            });
        }
    }

    group.finish();
}

fn bench_frame_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decode");

    for size in [100, 1000, 10000, 60000] {
        let frames = encoder(CompressionMode::None)
            .encode(&OutboundMessage::command(1, &payload(size)), MAX_FRAME_BODY)
            .unwrap();
        let wire = frames[0].to_vec();
        let mut decoder =
            FrameDecoder::new(DEFAULT_DECODER_CAPACITY, BufferPool::default(), MAX_MESSAGE_SIZE)
                .unwrap();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &wire, |b, wire| {
            b.iter(|| {
                decoder.extend(wire);
                black_box(decoder.decode_frame().unwrap())
            });
        });
    }

    group.finish();
}

fn bench_ring_transfer(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_transfer");

    for chunk in [64, 1500, 16384] {
        let data = vec![0x5Au8; chunk];
        let mut dst = vec![0u8; chunk];
        let mut ring = RingBuffer::with_capacity(64 * 1024).unwrap();

        group.throughput(Throughput::Bytes(chunk as u64));
        group.bench_with_input(BenchmarkId::from_parameter(chunk), &data, |b, data| {
            b.iter(|| {
                ring.write(data);
                black_box(ring.read(&mut dst, 0))
            });
        });
    }

    group.finish();
}

fn bench_crc32c(c: &mut Criterion) {
    let mut group = c.benchmark_group("crc32c");

    for size in [100, 1000, 10000, 100000] {
        let data = vec![0x42u8; size];

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| black_box(crc32c::crc32c(data)));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_payload_encode,
    bench_payload_decode,
    bench_frame_encode,
    bench_frame_decode,
    bench_ring_transfer,
    bench_crc32c,
);

criterion_main!(benches);
