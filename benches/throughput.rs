use criterion::{black_box, criterion_group, criterion_main, Criterion};
use indumpco::chunker::Chunker;
use indumpco::format::{encode_z, md5_hex};
use std::io::Cursor;

fn text_stream(len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len + 64);
    let mut n = 0u64;
    while out.len() < len {
        n += 1;
        out.extend_from_slice(format!("{n} bottles of beer on the wall\n").as_bytes());
    }
    out.truncate(len);
    out
}

fn bench_chunker(c: &mut Criterion) {
    let data = text_stream(8 * 1024 * 1024);
    c.bench_function("chunk_8mib", |b| {
        b.iter(|| {
            Chunker::new(Cursor::new(black_box(&data[..])))
                .map(|seg| seg.unwrap().len())
                .sum::<usize>()
        })
    });
}

fn bench_codec(c: &mut Criterion) {
    let seg = text_stream(1024 * 1024);
    c.bench_function("md5_1mib", |b| b.iter(|| md5_hex(black_box(&seg))));
    c.bench_function("encode_z_1mib", |b| {
        b.iter(|| {
            let mut out = Vec::new();
            encode_z(&mut out, black_box(&seg)).unwrap();
            out.len()
        })
    });
}

criterion_group!(benches, bench_chunker, bench_codec);
criterion_main!(benches);
