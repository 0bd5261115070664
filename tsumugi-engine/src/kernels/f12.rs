//! F12: packed 12-bit E4M7 float, range +/- 6.1035156e-5 .. 3.984375.
//!
//! The f32 bit pattern of a value is `((se12 & 0xFFFF87FF) + 0x3880) << 16`.
//! Storage packs 16 consecutive values into 24 bytes: the high 8 bits of each
//! value in bytes 0..16, the low nibbles paired into bytes 16..24.

use super::u16_at;
use crate::error::{Result, RtError};
use half::f16;

const F12_CVT_MSK: u32 = 0xffff_87ff;
const F12_CVT_LSL: u32 = 16;
const F12_CVT_ADD: u32 = 0x3880;

const F12_CVT_MAX: f32 = 4.0;
/// 4.00 in f16 / bf16, the largest source magnitudes convertible to F12.
pub const F16_MAX: u16 = 17408;
pub const BF16_MAX: u16 = 16512;

#[inline]
fn f12_to_f32(code: i32) -> f32 {
    let se = (((code << 4) as i16) >> 4) as i32 as u32; // sign extend 12 bits
    f32::from_bits((se & F12_CVT_MSK).wrapping_add(F12_CVT_ADD) << F12_CVT_LSL)
}

/// f32 -> f12 E4M7 (exponent offset 113) with round-to-nearest over the
/// clamped candidate and its two neighbours.
fn f32_to_f12(v: f32) -> u16 {
    let a = v.to_bits();
    let e = ((a >> 23) & 0xff) as i32;
    let m = ((a >> (23 - 7)) & ((1 << 7) - 1)) as i32;
    let k = (m + ((e - 113) << 7)).clamp(0, (1 << 11) - 1);

    let ki = if k > 0 { k - 1 } else { k };
    let ks = if k < (1 << 11) - 1 { k + 1 } else { k };

    let ec = (f12_to_f32(k) - v).abs();
    let ei = (f12_to_f32(ki) - v).abs();
    let es = (f12_to_f32(ks) - v).abs();

    if ei < ec {
        ki as u16
    } else if es < ec {
        ks as u16
    } else {
        k as u16
    }
}

fn build_encode_lut(to_f32: impl Fn(u16) -> f32, max_code: u16) -> Result<Box<[u16]>> {
    if to_f32(max_code) != F12_CVT_MAX {
        return Err(RtError::Numeric("f12 encode table constants".into()));
    }
    let mut lut = vec![0u16; 0x10000];
    for i in 0..0x8000usize {
        let k = f32_to_f12(to_f32(i as u16));
        lut[i] = k;
        lut[i + 0x8000] = (1 << 11) | k;
    }
    Ok(lut.into_boxed_slice())
}

pub fn build_encode_lut_f16() -> Result<Box<[u16]>> {
    build_encode_lut(|b| f16::from_bits(b).to_f32(), F16_MAX)
}

pub fn build_encode_lut_bf16() -> Result<Box<[u16]>> {
    build_encode_lut(|b| f32::from_bits((b as u32) << 16), BF16_MAX)
}

/// Pack 16 f12 codes into 24 bytes.
fn pack_f12(e: &mut [u8], f12: &[u16; 16]) {
    for i in 0..8 {
        e[i] = (f12[i] >> 4) as u8;
        e[i + 8] = (f12[i + 8] >> 4) as u8;
        e[i + 16] = ((f12[i] & 0xf) | ((f12[i + 8] & 0xf) << 4)) as u8;
    }
}

/// Encode an f16 or bf16 buffer (per `lut`) into packed f12. The element
/// count must be a multiple of 16.
pub fn encode(dst: &mut [u8], src: &[u8], lut: &[u16], src_max: u16, src_name: &str) -> Result<()> {
    let ne = src.len() / 2;
    debug_assert!(ne % 16 == 0);
    let mut cvt = [0u16; 16];
    for g in 0..ne / 16 {
        for (j, c) in cvt.iter_mut().enumerate() {
            let a = u16_at(src, g * 16 + j);
            if (a & 0x7fff) > src_max {
                return Err(RtError::Numeric(format!(
                    "conversion {src_name} to F12 out of range"
                )));
            }
            *c = lut[a as usize];
        }
        pack_f12(&mut dst[g * 24..g * 24 + 24], &cvt);
    }
    Ok(())
}

/// Unpack one 24-byte group into 16 f12 codes (with the packed high byte
/// still un-extended; `f12_to_f32` finishes the sign).
#[inline]
fn unpack_group(e: &[u8]) -> [i32; 16] {
    let mut out = [0i32; 16];
    for i in 0..8 {
        out[i] = (((e[i] as i8 as i32) << 4) | (e[16 + i] & 0xf) as i32) & 0xfff;
        out[i + 8] = (((e[i + 8] as i8 as i32) << 4) | (e[16 + i] >> 4) as i32) & 0xfff;
    }
    out
}

pub fn cvt_to_f32(dst: &mut [f32], src: &[u8]) {
    debug_assert!(dst.len() % 16 == 0);
    for (g, chunk) in dst.chunks_exact_mut(16).enumerate() {
        let codes = unpack_group(&src[g * 24..g * 24 + 24]);
        for (d, code) in chunk.iter_mut().zip(codes) {
            *d = f12_to_f32(code);
        }
    }
}

pub fn matmul_scalar(res: &mut [f32], vec: &[f32], mat: &[u8], wx: usize, wy: usize) {
    debug_assert!(wx % 16 == 0);
    let row_bytes = wx + (wx >> 1);
    for (y, r) in res.iter_mut().take(wy).enumerate() {
        let row = &mat[y * row_bytes..];
        let mut acc = 0.0f32;
        for g in 0..wx / 16 {
            let codes = unpack_group(&row[g * 24..g * 24 + 24]);
            let v = &vec[g * 16..g * 16 + 16];
            for (code, vj) in codes.iter().zip(v) {
                acc += vj * f12_to_f32(*code);
            }
        }
        *r = acc;
    }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2", enable = "fma")]
pub unsafe fn matmul_avx2(res: &mut [f32], vec: &[f32], mat: &[u8], wx: usize, wy: usize) {
    use super::hsum::hsum_ps_avx_2x;
    use std::arch::x86_64::*;
    unsafe {
        let v = vec.as_ptr();
        let mut e = mat.as_ptr();
        for r in res.iter_mut().take(wy) {
            let mut acc0 = _mm256_setzero_ps();
            let mut acc1 = _mm256_setzero_ps();
            let mut i = 0;
            while i != wx {
                // unpack 16 f12 to 16 f32
                let ld0 = _mm_loadu_si128(e as *const __m128i);
                let mut r0l = _mm256_cvtepi8_epi32(ld0);
                let mut r0h =
                    _mm256_cvtepi8_epi32(_mm_shuffle_epi32::<{ (3 << 6) | (2 << 4) | (3 << 2) | 2 }>(ld0));

                r0l = _mm256_slli_epi32::<4>(r0l);
                r0h = _mm256_slli_epi32::<4>(r0h);

                let m = _mm256_cvtepu8_epi32(_mm_loadl_epi64(e.add(16) as *const __m128i));

                r0l = _mm256_or_si256(r0l, _mm256_and_si256(m, _mm256_set1_epi32(0xf)));
                r0h = _mm256_or_si256(r0h, _mm256_srli_epi32::<4>(m));

                r0l = _mm256_and_si256(r0l, _mm256_set1_epi32(F12_CVT_MSK as i32));
                r0h = _mm256_and_si256(r0h, _mm256_set1_epi32(F12_CVT_MSK as i32));

                r0l = _mm256_add_epi32(r0l, _mm256_set1_epi32(F12_CVT_ADD as i32));
                r0h = _mm256_add_epi32(r0h, _mm256_set1_epi32(F12_CVT_ADD as i32));

                r0l = _mm256_slli_epi32::<{ F12_CVT_LSL as i32 }>(r0l);
                r0h = _mm256_slli_epi32::<{ F12_CVT_LSL as i32 }>(r0h);

                acc0 = _mm256_fmadd_ps(_mm256_loadu_ps(v.add(i)), _mm256_castsi256_ps(r0l), acc0);
                acc1 = _mm256_fmadd_ps(_mm256_loadu_ps(v.add(i + 8)), _mm256_castsi256_ps(r0h), acc1);

                e = e.add(24);
                i += 16;
            }
            *r = hsum_ps_avx_2x(acc0, acc1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_known_values() {
        // code 0 is the smallest positive magnitude
        assert!((f12_to_f32(0) - 6.1035156e-5).abs() < 1e-9);
        // top positive code just under 4.0
        let top = f12_to_f32((1 << 11) - 1);
        assert!(top < 4.0 && top > 3.9);
    }

    #[test]
    fn test_pack_unpack_round_trip() {
        let mut codes = [0u16; 16];
        for (i, c) in codes.iter_mut().enumerate() {
            *c = ((i as u16) * 131) & 0xfff;
        }
        let mut packed = [0u8; 24];
        pack_f12(&mut packed, &codes);
        let out = unpack_group(&packed);
        for (i, o) in out.iter().enumerate() {
            assert_eq!(*o as u16, codes[i], "lane {i}");
        }
    }

    #[test]
    fn test_encode_decode_bounded_error() {
        let lut = build_encode_lut_f16().unwrap();
        let values = [0.5f32, -1.25, 3.5, 0.001, -3.984];
        let mut src = Vec::new();
        for v in values {
            src.extend_from_slice(&f16::from_f32(v).to_bits().to_le_bytes());
        }
        // pad to a full group of 16
        while src.len() < 32 {
            src.extend_from_slice(&[0, 0]);
        }
        let mut dst = [0u8; 24];
        encode(&mut dst, &src, &lut, F16_MAX, "F16").unwrap();
        let mut back = [0.0f32; 16];
        cvt_to_f32(&mut back, &dst);
        for (i, v) in values.iter().enumerate() {
            let err = (back[i] - v).abs();
            assert!(err <= 0.06 * v.abs().max(0.001), "value {v} decoded {}", back[i]);
        }
    }

    #[test]
    fn test_bf16_out_of_range_errors() {
        // 5.0 in bf16 exceeds the +/-3.984 representable range
        let lut = build_encode_lut_bf16().unwrap();
        let bits = (5.0f32.to_bits() >> 16) as u16;
        let mut src = Vec::new();
        src.extend_from_slice(&bits.to_le_bytes());
        while src.len() < 32 {
            src.extend_from_slice(&[0, 0]);
        }
        let mut dst = [0u8; 24];
        let r = encode(&mut dst, &src, &lut, BF16_MAX, "BF16");
        assert!(matches!(r, Err(RtError::Numeric(_))));
    }
}
