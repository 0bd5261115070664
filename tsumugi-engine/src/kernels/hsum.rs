//! Horizontal sum helpers for the SIMD matmul bodies.

use std::arch::x86_64::*;

#[inline]
#[target_feature(enable = "sse3")]
pub unsafe fn hsum_ps_sse(v: __m128) -> f32 {
    unsafe {
        let shuf = _mm_movehdup_ps(v); // broadcast elements 3,1 to 2,0
        let sums = _mm_add_ps(v, shuf);
        let shuf = _mm_movehl_ps(shuf, sums); // high half -> low half
        let sums = _mm_add_ss(sums, shuf);
        _mm_cvtss_f32(sums)
    }
}

#[inline]
#[target_feature(enable = "sse3")]
pub unsafe fn hsum_ps_sse_4x(a: __m128, b: __m128, c: __m128, d: __m128) -> f32 {
    unsafe { hsum_ps_sse(_mm_add_ps(_mm_add_ps(a, b), _mm_add_ps(c, d))) }
}

#[inline]
#[target_feature(enable = "avx")]
pub unsafe fn hsum_ps_avx(v: __m256) -> f32 {
    unsafe {
        let vlow = _mm256_castps256_ps128(v);
        let vhigh = _mm256_extractf128_ps::<1>(v);
        hsum_ps_sse(_mm_add_ps(vlow, vhigh))
    }
}

#[inline]
#[target_feature(enable = "avx")]
pub unsafe fn hsum_ps_avx_2x(a: __m256, b: __m256) -> f32 {
    unsafe { hsum_ps_avx(_mm256_add_ps(a, b)) }
}

#[inline]
#[target_feature(enable = "avx")]
pub unsafe fn hsum_ps_avx_4x(a: __m256, b: __m256, c: __m256, d: __m256) -> f32 {
    unsafe { hsum_ps_avx(_mm256_add_ps(_mm256_add_ps(a, b), _mm256_add_ps(c, d))) }
}
