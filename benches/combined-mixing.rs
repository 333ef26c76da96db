use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use std::time::{Duration, Instant};
use utils::{noise_frame, sine_frame};
use warble::{
    driver::{
        bench_internals::{open, seal, CryptoState, SecretKey, SpeakerQueues},
        CryptoMode,
    },
    id::UserId,
};

const TIMEOUT: Duration = Duration::from_millis(100);

fn filled_queues(speakers: u64) -> SpeakerQueues {
    let queues = SpeakerQueues::new(25);
    let now = Instant::now();

    for user in 0..speakers {
        queues.push(UserId(user), noise_frame(user as u32 + 1), now);
    }

    queues
}

fn mix_tick(c: &mut Criterion) {
    let mut group = c.benchmark_group("Combined mix (n speakers)");

    for n in [1u64, 2, 4, 8, 16, 32] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter_batched_ref(
                || filled_queues(n),
                |q| black_box(q.mix_tick(Instant::now(), TIMEOUT)),
                BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

fn packet_crypto(c: &mut Criterion) {
    let key = SecretKey::new([7u8; 32]);
    let opus = utils::to_be_bytes(&sine_frame(440.0, 8_000, 0)[..80]);

    let mut group = c.benchmark_group("Seal then open");

    for mode in CryptoMode::PREFERENCE {
        group.bench_with_input(BenchmarkId::from_parameter(mode), &mode, |b, &mode| {
            let mut state = CryptoState::from(mode);
            let mut seq = 0u16;

            b.iter(|| {
                seq = seq.wrapping_add(1);
                let raw = seal(&mut state, &key, seq, 960 * u32::from(seq), 1, &opus).unwrap();
                black_box(open(mode, &key, &raw).unwrap())
            })
        });
    }

    group.finish();
}

criterion_group!(benches, mix_tick, packet_crypto);
criterion_main!(benches);
