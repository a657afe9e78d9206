use crate::meta::MetricType;

/// Pairwise distance kernel: `(query, row) -> distance`. For L2 the value is
/// the squared euclidean distance; for inner product the raw dot product.
pub type Kernel = fn(&[f32], &[f32]) -> f32;

struct KernelEntry {
    metric: MetricType,
    width: usize,
    kernel: Kernel,
}

#[cfg(target_arch = "x86_64")]
const REGISTRY: &[KernelEntry] = &[
    KernelEntry { metric: MetricType::L2, width: 16, kernel: l2_x16 },
    KernelEntry { metric: MetricType::L2, width: 8, kernel: l2_x8 },
    KernelEntry { metric: MetricType::L2, width: 1, kernel: l2_scalar },
    KernelEntry { metric: MetricType::Ip, width: 16, kernel: ip_x16 },
    KernelEntry { metric: MetricType::Ip, width: 8, kernel: ip_x8 },
    KernelEntry { metric: MetricType::Ip, width: 1, kernel: ip_scalar },
];

#[cfg(not(target_arch = "x86_64"))]
const REGISTRY: &[KernelEntry] = &[
    KernelEntry { metric: MetricType::L2, width: 1, kernel: l2_scalar },
    KernelEntry { metric: MetricType::Ip, width: 1, kernel: ip_scalar },
];

/// Vector width usable for `dim` on this CPU: 16 lanes on AVX-512 when the
/// dimension is a multiple of 16, 8 lanes on AVX for multiples of 8,
/// otherwise scalar.
pub fn select_width(dim: usize) -> usize {
    #[cfg(target_arch = "x86_64")]
    {
        if dim % 16 == 0 && std::is_x86_feature_detected!("avx512f") {
            return 16;
        }
        if dim % 8 == 0 && std::is_x86_feature_detected!("avx") {
            return 8;
        }
    }
    let _ = dim;
    1
}

/// Pure registry lookup. `width` must come from [`select_width`] so the CPU
/// feature the kernel relies on is known to be present.
pub fn kernel_for(metric: MetricType, width: usize) -> Kernel {
    REGISTRY
        .iter()
        .find(|entry| entry.metric == metric && entry.width == width)
        .map(|entry| entry.kernel)
        .unwrap_or(match metric {
            MetricType::L2 => l2_scalar,
            MetricType::Ip => ip_scalar,
        })
}

pub fn select_kernel(metric: MetricType, dim: usize) -> Kernel {
    kernel_for(metric, select_width(dim))
}

/// Apply `kernel` to every `dim`-sized row of a contiguous block.
pub fn compute_block(kernel: Kernel, query: &[f32], block: &[f32], dim: usize) -> Vec<f32> {
    debug_assert_eq!(query.len(), dim);
    block.chunks_exact(dim).map(|row| kernel(query, row)).collect()
}

pub fn l2_scalar(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let mut acc = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        let d = x - y;
        acc += d * d;
    }
    acc
}

pub fn ip_scalar(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[cfg(target_arch = "x86_64")]
fn l2_x8(a: &[f32], b: &[f32]) -> f32 {
    unsafe { l2_avx(a, b) }
}

#[cfg(target_arch = "x86_64")]
fn ip_x8(a: &[f32], b: &[f32]) -> f32 {
    unsafe { ip_avx(a, b) }
}

#[cfg(target_arch = "x86_64")]
fn l2_x16(a: &[f32], b: &[f32]) -> f32 {
    unsafe { l2_avx512(a, b) }
}

#[cfg(target_arch = "x86_64")]
fn ip_x16(a: &[f32], b: &[f32]) -> f32 {
    unsafe { ip_avx512(a, b) }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx")]
unsafe fn l2_avx(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::x86_64::*;

    let mut acc = _mm256_setzero_ps();
    let mut i = 0usize;
    while i + 8 <= a.len() {
        let va = _mm256_loadu_ps(a.as_ptr().add(i));
        let vb = _mm256_loadu_ps(b.as_ptr().add(i));
        let d = _mm256_sub_ps(va, vb);
        acc = _mm256_add_ps(acc, _mm256_mul_ps(d, d));
        i += 8;
    }
    let mut tmp = [0f32; 8];
    _mm256_storeu_ps(tmp.as_mut_ptr(), acc);
    let mut sum = tmp.iter().sum::<f32>();
    while i < a.len() {
        let d = a[i] - b[i];
        sum += d * d;
        i += 1;
    }
    sum
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx")]
unsafe fn ip_avx(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::x86_64::*;

    let mut acc = _mm256_setzero_ps();
    let mut i = 0usize;
    while i + 8 <= a.len() {
        let va = _mm256_loadu_ps(a.as_ptr().add(i));
        let vb = _mm256_loadu_ps(b.as_ptr().add(i));
        acc = _mm256_add_ps(acc, _mm256_mul_ps(va, vb));
        i += 8;
    }
    let mut tmp = [0f32; 8];
    _mm256_storeu_ps(tmp.as_mut_ptr(), acc);
    let mut sum = tmp.iter().sum::<f32>();
    while i < a.len() {
        sum += a[i] * b[i];
        i += 1;
    }
    sum
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx512f")]
unsafe fn l2_avx512(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::x86_64::*;

    let mut acc = _mm512_setzero_ps();
    let mut i = 0usize;
    while i + 16 <= a.len() {
        let va = _mm512_loadu_ps(a.as_ptr().add(i));
        let vb = _mm512_loadu_ps(b.as_ptr().add(i));
        let d = _mm512_sub_ps(va, vb);
        acc = _mm512_fmadd_ps(d, d, acc);
        i += 16;
    }
    let mut sum = _mm512_reduce_add_ps(acc);
    while i < a.len() {
        let d = a[i] - b[i];
        sum += d * d;
        i += 1;
    }
    sum
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx512f")]
unsafe fn ip_avx512(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::x86_64::*;

    let mut acc = _mm512_setzero_ps();
    let mut i = 0usize;
    while i + 16 <= a.len() {
        let va = _mm512_loadu_ps(a.as_ptr().add(i));
        let vb = _mm512_loadu_ps(b.as_ptr().add(i));
        acc = _mm512_fmadd_ps(va, vb, acc);
        i += 16;
    }
    let mut sum = _mm512_reduce_add_ps(acc);
    while i < a.len() {
        sum += a[i] * b[i];
        i += 1;
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn approx_close(expected: f32, actual: f32, eps: f32) -> bool {
        let allowance = eps.max(expected.abs() * 1e-5);
        (expected - actual).abs() <= allowance
    }

    #[test]
    fn every_dim_dispatches_to_a_valid_kernel() {
        let mut rng = StdRng::seed_from_u64(42);
        for dim in [1usize, 7, 8, 15, 16, 17, 512] {
            let a: Vec<f32> = (0..dim).map(|_| rng.gen()).collect();
            let b: Vec<f32> = (0..dim).map(|_| rng.gen()).collect();
            for metric in [MetricType::L2, MetricType::Ip] {
                let kernel = select_kernel(metric, dim);
                let scalar = kernel_for(metric, 1);
                assert!(
                    approx_close(scalar(&a, &b), kernel(&a, &b), 1e-4),
                    "metric={metric:?} dim={dim}"
                );
            }
        }
    }

    #[test]
    fn registry_returns_metric_correct_kernels() {
        // The inner-product entry for every width must behave like an inner
        // product, not L2 (dim 16 is the historically miswired case).
        let a = vec![1.0f32; 16];
        let b = vec![2.0f32; 16];
        for width in [1usize, 8, 16] {
            let ip = kernel_for(MetricType::Ip, width);
            let l2 = kernel_for(MetricType::L2, width);
            if select_width(16) >= width {
                assert!(approx_close(32.0, ip(&a, &b), 1e-4), "ip width={width}");
                assert!(approx_close(16.0, l2(&a, &b), 1e-4), "l2 width={width}");
            }
        }
    }

    #[test]
    fn select_width_respects_divisibility() {
        assert_eq!(select_width(7), 1);
        assert!(matches!(select_width(8), 1 | 8));
        assert!(matches!(select_width(16), 1 | 8 | 16));
        assert_ne!(select_width(17), 8);
    }

    #[test]
    fn compute_block_matches_pairwise() {
        let mut rng = StdRng::seed_from_u64(7);
        let dim = 24;
        let query: Vec<f32> = (0..dim).map(|_| rng.gen()).collect();
        let rows: Vec<f32> = (0..dim * 5).map(|_| rng.gen()).collect();
        let kernel = select_kernel(MetricType::L2, dim);
        let out = compute_block(kernel, &query, &rows, dim);
        assert_eq!(out.len(), 5);
        for (i, row) in rows.chunks_exact(dim).enumerate() {
            assert!(approx_close(kernel(&query, row), out[i], 1e-5));
        }
    }
}
