//! SF16: shifted 16-bit float, range +/- 1.8626451e-9 .. 7.9960938.
//!
//! The f32 bit pattern of a value is `((se16 & 0xFFFC7FFF) + 0x18800) << 13`
//! where `se16` is the sign-extended 16-bit code. The F16 -> SF16 map is
//! exactly invertible except F16 zero, which lands on the smallest magnitude.

use super::u16_at;
use crate::error::{Result, RtError};
use half::f16;

const SF16_CVT_MSK: u32 = 0xfffc_7fff;
const SF16_CVT_LSL: u32 = 13;
const SF16_CVT_ADD: u32 = 0x18800;

const SF16_CVT_MAX: f32 = 8.0;
/// 8.00 in f16, the largest f16 magnitude convertible to SF16.
const F16_TO_SF16_MAX: u16 = 18432;

#[inline]
fn sf16_to_f32(s: u16) -> f32 {
    let se = s as i16 as i32 as u32; // sign extend
    f32::from_bits((se & SF16_CVT_MSK).wrapping_add(SF16_CVT_ADD) << SF16_CVT_LSL)
}

/// f32 -> sf16 positive code (exponent offset 98), unclamped.
fn f32_to_sf16(v: f32) -> i32 {
    let a = v.to_bits();
    let e = ((a >> 23) & 0xff) as i32;
    let m = ((a >> (23 - 10)) & ((1 << 10) - 1)) as i32;
    m + ((e - 98) << 10)
}

/// Build the f16 -> sf16 encode table (full 64K, sign handled by halves).
/// No rounding is needed: every nonzero f16 below the max maps exactly.
pub fn build_encode_lut() -> Result<Box<[u16]>> {
    if f16::from_bits(F16_TO_SF16_MAX).to_f32() != SF16_CVT_MAX {
        return Err(RtError::Numeric("sf16 encode table constants".into()));
    }
    let mut lut = vec![0u16; 0x10000];
    for i in 0..0x8000usize {
        let f32v = f16::from_bits(i as u16).to_f32();
        let k = f32_to_sf16(f32v).clamp(0, 0x7fff) as u16;
        lut[i] = k;
        lut[i + 0x8000] = 0x8000 | k;
    }
    Ok(lut.into_boxed_slice())
}

/// Encode an f16 buffer to sf16, failing on out-of-range magnitudes.
pub fn encode_from_f16(dst: &mut [u8], src: &[u8], lut: &[u16]) -> Result<()> {
    let ne = src.len() / 2;
    for i in 0..ne {
        let a = u16_at(src, i);
        if (a & 0x7fff) > F16_TO_SF16_MAX {
            return Err(RtError::Numeric("conversion F16 to SF16 out of range".into()));
        }
        let s = lut[a as usize];
        dst[2 * i..2 * i + 2].copy_from_slice(&s.to_le_bytes());
    }
    Ok(())
}

pub fn cvt_to_f32(dst: &mut [f32], src: &[u8]) {
    for (i, d) in dst.iter_mut().enumerate() {
        *d = sf16_to_f32(u16_at(src, i));
    }
}

pub fn matmul_scalar(res: &mut [f32], vec: &[f32], mat: &[u8], wx: usize, wy: usize) {
    for (y, r) in res.iter_mut().take(wy).enumerate() {
        let row = y * wx;
        let mut acc = 0.0f32;
        for (i, v) in vec.iter().take(wx).enumerate() {
            acc += v * sf16_to_f32(u16_at(mat, row + i));
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
                // 4 sf16 -> 4 f32: sign extend, mask, add, shift
                let se = _mm_cvtepi16_epi32(_mm_loadl_epi64(m.add(2 * i) as *const __m128i));
                let w = _mm_slli_epi32::<{ SF16_CVT_LSL as i32 }>(_mm_add_epi32(
                    _mm_and_si128(se, _mm_set1_epi32(SF16_CVT_MSK as i32)),
                    _mm_set1_epi32(SF16_CVT_ADD as i32),
                ));
                acc = _mm_add_ps(acc, _mm_mul_ps(_mm_castsi128_ps(w), _mm_loadu_ps(v.add(i))));
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
                let se = _mm256_cvtepi16_epi32(_mm_loadu_si128(m.add(2 * i) as *const __m128i));
                let w = _mm256_slli_epi32::<{ SF16_CVT_LSL as i32 }>(_mm256_add_epi32(
                    _mm256_and_si256(se, _mm256_set1_epi32(SF16_CVT_MSK as i32)),
                    _mm256_set1_epi32(SF16_CVT_ADD as i32),
                ));
                acc = _mm256_fmadd_ps(_mm256_castsi256_ps(w), _mm256_loadu_ps(v.add(i)), acc);
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
    fn test_f16_round_trip_exact() {
        // every in-range nonzero f16 value survives f16 -> sf16 -> f32
        let lut = build_encode_lut().unwrap();
        for v in [0.5f32, 1.0, -1.5, 3.25, 7.5, -7.996, 0.0001220703125] {
            let h = f16::from_f32(v);
            let sf = lut[h.to_bits() as usize];
            assert_eq!(sf16_to_f32(sf), h.to_f32(), "value {v}");
        }
    }

    #[test]
    fn test_zero_maps_to_min_magnitude() {
        let lut = build_encode_lut().unwrap();
        let sf = lut[0]; // +0.0 in f16
        let d = sf16_to_f32(sf);
        assert!(d > 0.0 && d < 2e-9, "got {d}");
    }

    #[test]
    fn test_encode_range_check() {
        let lut = build_encode_lut().unwrap();
        // 16.0 in f16 is above the 8.0 saturation bound
        let src = f16::from_f32(16.0).to_bits().to_le_bytes();
        let mut dst = [0u8; 2];
        assert!(encode_from_f16(&mut dst, &src, &lut).is_err());
    }

    #[test]
    fn test_max_value_saturates() {
        let lut = build_encode_lut().unwrap();
        // 8.0 passes the range check but saturates to the largest code
        let src = f16::from_f32(8.0).to_bits().to_le_bytes();
        let mut dst = [0u8; 2];
        encode_from_f16(&mut dst, &src, &lut).unwrap();
        let sf = u16::from_le_bytes(dst);
        assert_eq!(sf16_to_f32(sf), 7.99609375);
    }
}
