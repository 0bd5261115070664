//! f32 * f32 matmul and the f32 copy path.

#[inline]
fn f32_at(src: &[u8], i: usize) -> f32 {
    f32::from_le_bytes([src[4 * i], src[4 * i + 1], src[4 * i + 2], src[4 * i + 3]])
}

pub fn cvt_copy(dst: &mut [f32], src: &[u8]) {
    for (i, d) in dst.iter_mut().enumerate() {
        *d = f32_at(src, i);
    }
}

pub fn matmul_scalar(res: &mut [f32], vec: &[f32], mat: &[u8], wx: usize, wy: usize) {
    for (y, r) in res.iter_mut().take(wy).enumerate() {
        let row = y * wx;
        let mut acc = 0.0f32;
        for (i, v) in vec.iter().take(wx).enumerate() {
            acc += v * f32_at(mat, row + i);
        }
        *r = acc;
    }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "sse4.2")]
pub unsafe fn matmul_sse(res: &mut [f32], vec: &[f32], mat: &[u8], wx: usize, wy: usize) {
    use super::hsum::hsum_ps_sse_4x;
    use std::arch::x86_64::*;
    unsafe {
        let v = vec.as_ptr();
        let mut m = mat.as_ptr() as *const f32;
        for r in res.iter_mut().take(wy) {
            let mut acc0 = _mm_setzero_ps();
            let mut acc1 = _mm_setzero_ps();
            let mut acc2 = _mm_setzero_ps();
            let mut acc3 = _mm_setzero_ps();
            let mut i = 0;
            while i != wx {
                acc0 = _mm_add_ps(acc0, _mm_mul_ps(_mm_loadu_ps(v.add(i)), _mm_loadu_ps(m.add(i))));
                acc1 = _mm_add_ps(acc1, _mm_mul_ps(_mm_loadu_ps(v.add(i + 4)), _mm_loadu_ps(m.add(i + 4))));
                acc2 = _mm_add_ps(acc2, _mm_mul_ps(_mm_loadu_ps(v.add(i + 8)), _mm_loadu_ps(m.add(i + 8))));
                acc3 = _mm_add_ps(acc3, _mm_mul_ps(_mm_loadu_ps(v.add(i + 12)), _mm_loadu_ps(m.add(i + 12))));
                i += 16;
            }
            *r = hsum_ps_sse_4x(acc0, acc1, acc2, acc3);
            m = m.add(wx);
        }
    }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx")]
pub unsafe fn matmul_avx(res: &mut [f32], vec: &[f32], mat: &[u8], wx: usize, wy: usize) {
    use super::hsum::hsum_ps_avx_2x;
    use std::arch::x86_64::*;
    unsafe {
        let v = vec.as_ptr();
        let mut m = mat.as_ptr() as *const f32;
        for r in res.iter_mut().take(wy) {
            let mut acc0 = _mm256_setzero_ps();
            let mut acc1 = _mm256_setzero_ps();
            let mut i = 0;
            while i != wx {
                acc0 = _mm256_add_ps(
                    acc0,
                    _mm256_mul_ps(_mm256_loadu_ps(v.add(i)), _mm256_loadu_ps(m.add(i))),
                );
                acc1 = _mm256_add_ps(
                    acc1,
                    _mm256_mul_ps(_mm256_loadu_ps(v.add(i + 8)), _mm256_loadu_ps(m.add(i + 8))),
                );
                i += 16;
            }
            *r = hsum_ps_avx_2x(acc0, acc1);
            m = m.add(wx);
        }
    }
}
