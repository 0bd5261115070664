//! Matmul kernel benchmarks across the packed weight formats.
//!
//! Run with: cargo bench

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use tsumugi_engine::{Kernels, WType};

const WX: usize = 4096;
const WY: usize = 256;

fn rand_f32(state: &mut u64) -> f32 {
    *state ^= *state >> 12;
    *state ^= *state << 25;
    *state ^= *state >> 27;
    ((state.wrapping_mul(0x2545F4914F6CDD1D) >> 32) as u32 >> 8) as f32 / 16777216.0 * 2.0 - 1.0
}

fn bench_matmul(c: &mut Criterion) {
    let kernels = match Kernels::init(-1) {
        Ok(k) => k,
        Err(e) => {
            eprintln!("skipping matmul benchmarks: {e}");
            return;
        }
    };

    let mut state = 543u64;
    let vec: Vec<f32> = (0..WX).map(|_| rand_f32(&mut state)).collect();
    let w: Vec<f32> = (0..WX * WY).map(|_| rand_f32(&mut state)).collect();

    let w_f32: Vec<u8> = w.iter().flat_map(|v| v.to_le_bytes()).collect();
    let w_f16: Vec<u8> = w
        .iter()
        .flat_map(|v| half::f16::from_f32(*v).to_bits().to_le_bytes())
        .collect();
    let w_bf16: Vec<u8> = w
        .iter()
        .flat_map(|v| ((v.to_bits() >> 16) as u16).to_le_bytes())
        .collect();

    let ne = WX * WY;
    let mut w_sf16 = vec![0u8; ne * 2];
    kernels
        .convert(WType::Sf16, WType::F16, &mut w_sf16, &w_f16, ne)
        .unwrap();
    let mut w_f12 = vec![0u8; WType::F12.byte_len(ne)];
    kernels
        .convert(WType::F12, WType::F16, &mut w_f12, &w_f16, ne)
        .unwrap();
    let mut w_f8 = vec![0u8; ne];
    kernels
        .convert(WType::F8, WType::F16, &mut w_f8, &w_f16, ne)
        .unwrap();

    let mut res = vec![0.0f32; WY];
    let mut group = c.benchmark_group("matmul");
    for (name, ty, bytes) in [
        ("f32", WType::F32, &w_f32),
        ("f16", WType::F16, &w_f16),
        ("bf16", WType::Bf16, &w_bf16),
        ("sf16", WType::Sf16, &w_sf16),
        ("f12", WType::F12, &w_f12),
        ("f8", WType::F8, &w_f8),
    ] {
        group.bench_function(name, |b| {
            b.iter(|| {
                kernels.matmul(ty, black_box(&mut res), black_box(&vec), bytes, WX, WY);
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_matmul);
criterion_main!(benches);
