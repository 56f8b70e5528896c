//! Microbenchmarks for the hot-path SIMD kernels: GEMV against a Q4_0
//! weight row and the dense GEMM tiling. Tracks the performance contract
//! the dequantize-fused GEMV loop depends on (§9 "hot-path
//! polymorphism" — a function-call boundary between dequantize and the
//! dot product costs roughly 20% throughput).

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use qor_engine::kernels::gemm::gemm_f32;
use qor_engine::kernels::gemv::gemv_q4_f32;
use qor_engine::kernels::Dispatch;
use qor_engine::tensor::{create_tensor_view, DType, Q4_0_BLOCK_BYTES};
use qor_engine::{arena::Arena, config::SimdDispatch};

fn make_q4_0_weights(rows: u32, cols: u32) -> Vec<u8> {
    let blocks_per_row = (cols / 32) as usize;
    let mut buf = Vec::with_capacity(rows as usize * blocks_per_row * Q4_0_BLOCK_BYTES);
    for r in 0..rows as usize {
        for b in 0..blocks_per_row {
            let scale = 0.05f32 + (r % 7) as f32 * 0.001;
            buf.extend_from_slice(&scale.to_le_bytes());
            for byte in 0..16 {
                let lo = ((r + b + byte) % 16) as u8;
                let hi = ((r + b + byte + 1) % 16) as u8;
                buf.push(lo | (hi << 4));
            }
        }
    }
    buf
}

fn bench_gemv(c: &mut Criterion) {
    let dispatch = Dispatch::detect(SimdDispatch::Auto);
    let mut group = c.benchmark_group("gemv_q4_f32");

    for &(m, n) in &[(1u32, 4096u32), (1, 11008), (4, 4096)] {
        let weights = make_q4_0_weights(m, n);
        let view = unsafe {
            create_tensor_view(weights.as_ptr(), weights.as_ptr(), weights.len(), DType::Q4_0, [m, n, 1, 1], "bench_w")
                .unwrap()
        };
        let x = vec![0.01f32; n as usize];
        let mut out = vec![0.0f32; m as usize];

        group.throughput(Throughput::Elements((m as u64) * (n as u64)));
        group.bench_with_input(BenchmarkId::new("rows_x_cols", format!("{m}x{n}")), &(m, n), |bencher, _| {
            bencher.iter(|| {
                gemv_q4_f32(dispatch, black_box(&view), black_box(&x), black_box(&mut out)).unwrap();
            });
        });
    }
    group.finish();
}

fn bench_gemm(c: &mut Criterion) {
    let dispatch = Dispatch::detect(SimdDispatch::Auto);
    let mut group = c.benchmark_group("gemm_f32");

    for &(m, k, n) in &[(64usize, 64usize, 64usize), (128, 128, 128)] {
        let a = vec![0.01f32; m * k];
        let b_t = vec![0.02f32; n * k]; // already [N, K]
        let mut out = vec![0.0f32; m * n];
        let mut arena = Arena::new(1024 * 1024);

        group.throughput(Throughput::Elements((m * k * n) as u64));
        group.bench_with_input(BenchmarkId::new("m_k_n", format!("{m}x{k}x{n}")), &(m, k, n), |bencher, _| {
            bencher.iter(|| {
                gemm_f32(
                    dispatch,
                    black_box(&mut arena),
                    black_box(&a),
                    black_box(&b_t),
                    black_box(&mut out),
                    m,
                    k,
                    n,
                    true,
                )
                .unwrap();
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_gemv, bench_gemm);
criterion_main!(benches);
