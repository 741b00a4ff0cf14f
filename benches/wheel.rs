use criterion::{black_box, criterion_group, criterion_main, Criterion};
use muxnet::codec::header::HeaderMode;
use muxnet::core::conn::Channel;
use muxnet::timer::wheel::TimerWheel;

fn bench_wheel(c: &mut Criterion) {
    c.bench_function("wheel_insert_remove_10k", |b| {
        b.iter(|| {
            let mut wheel = TimerWheel::new(0);
            let ids: Vec<_> =
                (0..10_000u32).map(|i| wheel.insert(i % 4096, i)).collect();
            for id in ids {
                black_box(wheel.remove(id));
            }
        })
    });

    c.bench_function("wheel_advance_4096_ticks", |b| {
        b.iter(|| {
            let mut wheel = TimerWheel::new(0);
            for i in 0..10_000u32 {
                wheel.insert(i % 4096, i);
            }
            let mut fired = Vec::with_capacity(10_000);
            wheel.advance(4096, &mut fired);
            black_box(fired.len())
        })
    });
}

fn bench_framing(c: &mut Criterion) {
    let payload = vec![0xA5u8; 1024];
    c.bench_function("frame_round_trip_1k", |b| {
        b.iter(|| {
            let mut tx = Channel::new(HeaderMode::WordLsb);
            let mut rx = Channel::new(HeaderMode::WordLsb);
            tx.send(&payload, 0).unwrap();
            rx.feed(&tx.take_outgoing()).unwrap();
            let mut out = [0u8; 2048];
            black_box(rx.recv(Some(&mut out)).unwrap())
        })
    });
}

criterion_group!(benches, bench_wheel, bench_framing);
criterion_main!(benches);
