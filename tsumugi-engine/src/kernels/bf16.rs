//! bf16 conversion and f32 * bf16 matmul. bf16 is the top 16 bits of f32,
//! so conversion is a zero-extend and shift.

use super::u16_at;

#[inline]
fn bf16_to_f32(b: u16) -> f32 {
    f32::from_bits((b as u32) << 16)
}

pub fn cvt_to_f32(dst: &mut [f32], src: &[u8]) {
    for (i, d) in dst.iter_mut().enumerate() {
        *d = bf16_to_f32(u16_at(src, i));
    }
}

pub fn matmul_scalar(res: &mut [f32], vec: &[f32], mat: &[u8], wx: usize, wy: usize) {
    for (y, r) in res.iter_mut().take(wy).enumerate() {
        let row = y * wx;
        let mut acc = 0.0f32;
        for (i, v) in vec.iter().take(wx).enumerate() {
            acc += v * bf16_to_f32(u16_at(mat, row + i));
        }
        *r = acc;
    }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "sse4.2")]
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
                let h = _mm_cvtepu16_epi32(_mm_loadl_epi64(m.add(2 * i) as *const __m128i));
                let w = _mm_castsi128_ps(_mm_slli_epi32::<16>(h));
                acc = _mm_add_ps(acc, _mm_mul_ps(w, _mm_loadu_ps(v.add(i))));
                i += 4;
            }
            *r = hsum_ps_sse(acc);
            m = m.add(2 * wx);
        }
    }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2", enable = "fma")]
pub unsafe fn matmul_avx2(res: &mut [f32], vec: &[f32], mat: &[u8], wx: usize, wy: usize) {
    use super::hsum::hsum_ps_avx;
    use std::arch::x86_64::*;
    unsafe {
        let v = vec.as_ptr();
        let mut m = mat.as_ptr();
        for r in res.iter_mut().take(wy) {
            let mut acc = _mm256_setzero_ps();
            let mut i = 0;
            while i != wx {
                let h = _mm256_cvtepu16_epi32(_mm_loadu_si128(m.add(2 * i) as *const __m128i));
                let w = _mm256_castsi256_ps(_mm256_slli_epi32::<16>(h));
                acc = _mm256_fmadd_ps(w, _mm256_loadu_ps(v.add(i)), acc);
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
    fn test_bf16_decode() {
        assert_eq!(bf16_to_f32(0x3F80), 1.0);
        assert_eq!(bf16_to_f32(0x4000), 2.0);
        assert_eq!(bf16_to_f32(0xC000), -2.0);
        assert_eq!(bf16_to_f32(0), 0.0);
    }

    #[test]
    fn test_matmul_scalar() {
        let mat: Vec<u8> = [0x3F80u16, 0x4000, 0x4040, 0x4080] // 1, 2, 3, 4
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let vec = [2.0f32, 2.0, 2.0, 2.0];
        let mut res = [0.0f32];
        matmul_scalar(&mut res, &vec, &mat, 4, 1);
        assert_eq!(res[0], 20.0);
    }
}
