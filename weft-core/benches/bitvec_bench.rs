use criterion::{black_box, criterion_group, criterion_main, Criterion};
use weft_core::bitvec::BitVector;

fn bench_set_test(c: &mut Criterion) {
    c.bench_function("bitvec_set", |b| {
        let mut bv = BitVector::new();
        let mut x = 0u64;
        b.iter(|| {
            x = x.wrapping_add(0x9e37_79b9);
            bv.set(black_box(x));
        });
    });

    c.bench_function("bitvec_test", |b| {
        let mut bv = BitVector::new();
        for x in 0..128u64 {
            bv.set(x);
        }
        let mut x = 0u64;
        b.iter(|| {
            x = x.wrapping_add(1);
            black_box(bv.test(black_box(x & 0xff)));
        });
    });
}

fn bench_encode(c: &mut Criterion) {
    let mut sparse = BitVector::new();
    for x in 0..16u64 {
        sparse.set(x);
    }
    let mut dense = BitVector::new();
    for x in 0..2048u64 {
        dense.set(x);
    }

    c.bench_function("bitvec_encode_sparse", |b| {
        b.iter(|| black_box(sparse.encode()));
    });
    c.bench_function("bitvec_encode_dense", |b| {
        b.iter(|| black_box(dense.encode()));
    });

    let enc = sparse.encode();
    c.bench_function("bitvec_decode_sparse", |b| {
        b.iter(|| BitVector::decode(black_box(&enc)).unwrap());
    });
}

fn bench_intersection(c: &mut Criterion) {
    let mut a = BitVector::new();
    let mut bvec = BitVector::new();
    for x in 0..256u64 {
        a.set(x);
        bvec.set(x + 128);
    }
    c.bench_function("bitvec_intersects", |b| {
        b.iter(|| black_box(a.intersects(black_box(&bvec))));
    });
}

criterion_group!(benches, bench_set_test, bench_encode, bench_intersection);
criterion_main!(benches);
