use criterion::{Criterion, criterion_group, criterion_main};
use pfs_check::{Codec, Decompressor};
use std::hint::black_box;
use std::io::Write;

fn zlib_pack(payload: &[u8]) -> Vec<u8> {
    let mut enc = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    enc.write_all(payload).expect("deflate");
    enc.finish().expect("finish")
}

fn lzo_literal_pack(payload: &[u8]) -> Vec<u8> {
    let rem = payload.len() - 18;
    let (zeros, last) = if rem % 255 == 0 {
        (rem / 255 - 1, 255)
    } else {
        (rem / 255, rem % 255)
    };
    let mut stream = vec![0x00];
    stream.extend(std::iter::repeat(0x00).take(zeros));
    stream.push(last as u8);
    stream.extend_from_slice(payload);
    stream.extend_from_slice(&[0x11, 0x00, 0x00]);
    stream
}

fn bench_decompress(c: &mut Criterion) {
    let payload: Vec<u8> = (0..4096_u32).map(|i| (i % 253) as u8).collect();

    let zlib_block = zlib_pack(&payload);
    c.bench_function("zlib_block_4k", |b| {
        let mut d = Decompressor::new(Codec::Zlib);
        b.iter(|| {
            let out = d.block(black_box(&zlib_block)).expect("inflate");
            black_box(out.len())
        });
    });

    let lzo_block = lzo_literal_pack(&payload);
    c.bench_function("lzo_block_4k_with_overlap_check", |b| {
        let mut d = Decompressor::new(Codec::Lzo);
        b.iter(|| {
            let out = d.block(black_box(&lzo_block)).expect("lzo");
            black_box(out.len())
        });
    });
}

criterion_group!(benches, bench_decompress);
criterion_main!(benches);
