//! f16 conversion and f32 * f16 matmul.
//!
//! When the CPU carries F16C the conversion is done in hardware; otherwise a
//! 64K lookup table built with the `half` crate drives the scalar paths
//! (Opterons 62xx, Xeon E55xx/X56xx and E5 v1 era parts have no F16C).

use super::u16_at;
use half::f16;

/// Build the full f16 -> f32 software table.
pub fn build_f16_lut() -> Box<[f32]> {
    let mut lut = vec![0.0f32; 0x10000];
    for (i, v) in lut.iter_mut().enumerate() {
        *v = f16::from_bits(i as u16).to_f32();
    }
    lut.into_boxed_slice()
}

pub fn cvt_to_f32_lut(dst: &mut [f32], src: &[u8], lut: &[f32]) {
    for (i, d) in dst.iter_mut().enumerate() {
        *d = lut[u16_at(src, i) as usize];
    }
}

/// Software per-element conversion, used when no table was built and the
/// element count defeats the vector widths.
pub fn cvt_to_f32_soft(dst: &mut [f32], src: &[u8]) {
    for (i, d) in dst.iter_mut().enumerate() {
        *d = f16::from_bits(u16_at(src, i)).to_f32();
    }
}

/// Table-free scalar matmul for odd row widths when no table was built.
pub fn matmul_soft(res: &mut [f32], vec: &[f32], mat: &[u8], wx: usize, wy: usize) {
    for (y, r) in res.iter_mut().take(wy).enumerate() {
        let row = y * wx;
        let mut acc = 0.0f32;
        for (i, v) in vec.iter().take(wx).enumerate() {
            acc += v * f16::from_bits(u16_at(mat, row + i)).to_f32();
        }
        *r = acc;
    }
}

pub fn matmul_lut(res: &mut [f32], vec: &[f32], mat: &[u8], wx: usize, wy: usize, lut: &[f32]) {
    for (y, r) in res.iter_mut().take(wy).enumerate() {
        let row = y * wx;
        let mut acc = 0.0f32;
        for (i, v) in vec.iter().take(wx).enumerate() {
            acc += v * lut[u16_at(mat, row + i) as usize];
        }
        *r = acc;
    }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "sse4.2", enable = "f16c")]
pub unsafe fn cvt_to_f32_sse(dst: &mut [f32], src: &[u8]) {
    use std::arch::x86_64::*;
    unsafe {
        let s = src.as_ptr();
        let d = dst.as_mut_ptr();
        let mut i = 0;
        while i != dst.len() {
            let h = _mm_loadl_epi64(s.add(2 * i) as *const __m128i);
            _mm_storeu_ps(d.add(i), _mm_cvtph_ps(h));
            i += 4;
        }
    }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx", enable = "f16c")]
pub unsafe fn cvt_to_f32_avx(dst: &mut [f32], src: &[u8]) {
    use std::arch::x86_64::*;
    unsafe {
        let s = src.as_ptr();
        let d = dst.as_mut_ptr();
        let mut i = 0;
        while i != dst.len() {
            let h = _mm_loadu_si128(s.add(2 * i) as *const __m128i);
            _mm256_storeu_ps(d.add(i), _mm256_cvtph_ps(h));
            i += 8;
        }
    }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "sse4.2", enable = "f16c")]
pub unsafe fn matmul_sse(res: &mut [f32], vec: &[f32], mat: &[u8], wx: usize, wy: usize) {
    use super::hsum::hsum_ps_sse;
    use std::arch::x86_64::*;
    unsafe {
        let v = vec.as_ptr();
        let mut m = mat.as_ptr();
        for r in res.iter_mut().take(wy) {
            let mut acc = _mm_setzero_ps();
            let mut i = 0;
            while i != wx {
                let h = _mm_cvtph_ps(_mm_loadl_epi64(m.add(2 * i) as *const __m128i));
                acc = _mm_add_ps(acc, _mm_mul_ps(h, _mm_loadu_ps(v.add(i))));
                i += 4;
            }
            *r = hsum_ps_sse(acc);
            m = m.add(2 * wx);
        }
    }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx", enable = "f16c")]
pub unsafe fn matmul_avx(res: &mut [f32], vec: &[f32], mat: &[u8], wx: usize, wy: usize) {
    use super::hsum::hsum_ps_avx;
    use std::arch::x86_64::*;
    unsafe {
        let v = vec.as_ptr();
        let mut m = mat.as_ptr();
        for r in res.iter_mut().take(wy) {
            let mut acc = _mm256_setzero_ps();
            let mut i = 0;
            while i != wx {
                let h = _mm256_cvtph_ps(_mm_loadu_si128(m.add(2 * i) as *const __m128i));
                acc = _mm256_add_ps(acc, _mm256_mul_ps(h, _mm256_loadu_ps(v.add(i))));
                i += 8;
            }
            *r = hsum_ps_avx(acc);
            m = m.add(2 * wx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lut_round_values() {
        let lut = build_f16_lut();
        assert_eq!(lut[f16::from_f32(1.0).to_bits() as usize], 1.0);
        assert_eq!(lut[f16::from_f32(-2.5).to_bits() as usize], -2.5);
        assert_eq!(lut[0], 0.0);
    }

    #[test]
    fn test_matmul_lut() {
        let lut = build_f16_lut();
        let w = [1.0f32, 2.0, 3.0, 4.0];
        let mat: Vec<u8> = w
            .iter()
            .flat_map(|v| f16::from_f32(*v).to_bits().to_le_bytes())
            .collect();
        let vec = [1.0f32, 1.0, 1.0, 1.0];
        let mut res = [0.0f32];
        matmul_lut(&mut res, &vec, &mat, 4, 1, &lut);
        assert_eq!(res[0], 10.0);
    }
}
