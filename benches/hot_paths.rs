use bgpwatcher::engine::{Aggregate, Contributions, ObservationKey};
use bgpwatcher::mrt::parse::parse_stream;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

const MRT_HEADER_SIZE: usize = 12;

fn mrt_record(mrt_type: u16, subtype: u16, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(MRT_HEADER_SIZE + body.len());
    out.extend_from_slice(&1_709_251_200u32.to_be_bytes());
    out.extend_from_slice(&mrt_type.to_be_bytes());
    out.extend_from_slice(&subtype.to_be_bytes());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(body);
    out
}

/// BGP4MP_MESSAGE_AS4 UPDATE with ORIGIN + AS_PATH attributes and
/// `prefixes` /24 announcements.
fn update_record(peer_as: u32, prefixes: u8) -> Vec<u8> {
    let attrs: [u8; 13] = [
        0x40, 1, 1, 0, // ORIGIN IGP
        0x40, 2, 6, 2, 1, 0, 0, 0xfd, 0xe9, // AS_PATH [65001]
    ];

    let mut nlri = Vec::new();
    for i in 0..prefixes {
        nlri.extend_from_slice(&[24, 10, i, (peer_as & 0xff) as u8]);
    }

    let mut payload = Vec::new();
    payload.extend_from_slice(&0u16.to_be_bytes());
    payload.extend_from_slice(&(attrs.len() as u16).to_be_bytes());
    payload.extend_from_slice(attrs);
    payload.extend_from_slice(&nlri);

    let mut body = Vec::new();
    body.extend_from_slice(&peer_as.to_be_bytes());
    body.extend_from_slice(&12654u32.to_be_bytes());
    body.extend_from_slice(&0u16.to_be_bytes());
    body.extend_from_slice(&1u16.to_be_bytes());
    body.extend_from_slice(&[192, 0, 2, 1, 192, 0, 2, 2]);
    body.extend_from_slice(&[0xff; 16]);
    body.extend_from_slice(&((19 + payload.len()) as u16).to_be_bytes());
    body.push(2);
    body.extend_from_slice(&payload);

    mrt_record(16, 4, &body)
}

fn update_stream() -> Vec<u8> {
    let mut data = Vec::new();
    for i in 0..2_000u32 {
        data.extend(update_record(65_000 + i % 40, 4));
    }
    data
}

fn partials() -> Vec<Contributions> {
    (0..16u32)
        .map(|file| {
            (0..5_000u32)
                .map(|i| {
                    let key = ObservationKey::new(
                        65_000 + (i + file) % 50,
                        format!("10.{}.{}.0/24", i / 256, i % 256),
                    );
                    (key, u64::from(file + 1))
                })
                .collect()
        })
        .collect()
}

fn bench_parse_stream(c: &mut Criterion) {
    let data = update_stream();

    c.bench_function("mrt/parse_stream_2000_updates", |b| {
        b.iter(|| {
            let mut out = Contributions::new();
            let summary = parse_stream(black_box(&data[..]), &mut out).expect("parse");
            black_box((summary.prefixes, out.len()))
        })
    });
}

fn bench_merge(c: &mut Criterion) {
    let parts = partials();

    c.bench_function("aggregate/merge_16_partials", |b| {
        b.iter(|| {
            let mut agg = Aggregate::new();
            for part in parts.iter().cloned() {
                agg.merge(part);
            }
            black_box(agg.len())
        })
    });

    c.bench_function("aggregate/into_rows", |b| {
        let mut agg = Aggregate::new();
        for part in parts.iter().cloned() {
            agg.merge(part);
        }
        b.iter(|| black_box(agg.clone().into_rows().len()))
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_parse_stream(c);
    bench_merge(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
