use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use tether_core::stream::{CipherReader, obfuscation_key};
use tether_core::{Command, Frame, FrameReader, FrameWriter};
use tether_crypto::KeyStream;

fn response_frame() -> Frame {
    Frame::new(Command::Response)
        .arg(42)
        .arg(0)
        .arg(7)
        .header("size", "1048576")
        .header("name", "report.pdf")
        .header("modified", "2026-10-15T09:12:44Z")
}

fn bench_frame_encode(c: &mut Criterion) {
    let frame = response_frame();

    let mut group = c.benchmark_group("frame_encode");
    group.throughput(Throughput::Bytes(frame.encode().len() as u64));
    group.bench_function("response_headers", |b| {
        b.iter(|| black_box(&frame).encode())
    });
    group.finish();
}

fn bench_frame_decode(c: &mut Criterion) {
    let wire = response_frame().encode();

    let mut group = c.benchmark_group("frame_decode");
    group.throughput(Throughput::Bytes(wire.len() as u64));

    group.bench_function("buffered", |b| {
        b.iter(|| {
            let mut reader = FrameReader::new(black_box(wire.as_slice()), true);
            reader.read_frame()
        })
    });

    group.bench_function("unbuffered", |b| {
        b.iter(|| {
            let mut reader = FrameReader::new(black_box(wire.as_slice()), false);
            reader.read_frame()
        })
    });

    group.finish();
}

fn bench_data_chunks(c: &mut Criterion) {
    let sizes: Vec<(usize, &str)> = vec![
        (512, "512_bytes"),
        (4096, "4096_bytes"),
        (16384, "16384_bytes"),
    ];

    let mut group = c.benchmark_group("data_chunk");

    for (size, name) in sizes {
        let payload = vec![0x42; size];
        let frame = Frame::new(Command::Data).arg(1).arg(size);

        let mut wire = FrameWriter::new(Vec::new());
        wire.write_frame_with_payload(&frame, &payload).unwrap();
        let wire = wire.into_inner();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("write_{name}"), |b| {
            b.iter(|| {
                let mut writer = FrameWriter::new(Vec::with_capacity(size + 32));
                writer.write_frame_with_payload(black_box(&frame), black_box(&payload))
            })
        });
        group.bench_function(format!("read_{name}"), |b| {
            b.iter(|| {
                let mut reader = FrameReader::new(black_box(wire.as_slice()), true);
                let _ = reader.read_frame();
                reader.read_payload(size)
            })
        });
    }

    group.finish();
}

fn bench_obfuscated_decode(c: &mut Criterion) {
    let mut wire = response_frame().encode();
    obfuscation_key().keystream().apply_keystream(&mut wire);

    let mut group = c.benchmark_group("obfuscated_decode");
    group.throughput(Throughput::Bytes(wire.len() as u64));
    group.bench_function("hello_path", |b| {
        b.iter(|| {
            let inner = CipherReader::new(black_box(wire.as_slice()), &obfuscation_key());
            let mut reader = FrameReader::new(inner, false);
            reader.read_frame()
        })
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_frame_encode,
    bench_frame_decode,
    bench_data_chunks,
    bench_obfuscated_decode,
);
criterion_main!(benches);
