//! SIMD-dispatched numeric kernels
//!
//! One matmul and one bulk conversion per weight dtype, specialised per SIMD
//! level (FPU baseline, SSE4.2, AVX, AVX2+FMA+F16C). The level is resolved
//! once at init from CPU detection and the requested mode; after that the hot
//! path takes a direct call. Load-time encoders into the packed formats
//! (SF16, F12, F8) are table driven and range checked.

mod bf16;
mod check;
mod f8;
mod f12;
mod fp16;
mod fp32;
mod sf16;

pub mod attention;
#[cfg(target_arch = "x86_64")]
pub(crate) mod hsum;

use crate::error::{Result, RtError};
use tracing::{debug, info, warn};

/// SIMD lane bound: matmul and conversion kernels never read further than
/// this many elements past a loop index, and vectorised paths require row
/// widths to be a multiple of it.
pub const SIMD_LV: usize = 32;

/// Weight storage dtypes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WType {
    F32,
    F16,
    Bf16,
    Sf16,
    F12,
    F8,
}

impl WType {
    pub fn name(self) -> &'static str {
        match self {
            WType::F32 => "fp32",
            WType::F16 => "fp16",
            WType::Bf16 => "bf16",
            WType::Sf16 => "sf16",
            WType::F12 => "f12",
            WType::F8 => "f8",
        }
    }

    /// Byte size of `ne` elements. F12 packs 16 values into 24 bytes.
    pub fn byte_len(self, ne: usize) -> usize {
        match self {
            WType::F32 => ne * 4,
            WType::F16 | WType::Bf16 | WType::Sf16 => ne * 2,
            WType::F12 => ne + (ne >> 1),
            WType::F8 => ne,
        }
    }
}

/// SIMD code level, ordered weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SimdLevel {
    Fpu = 0,
    Sse = 1,
    Avx = 2,
    Avx2 = 3,
}

impl SimdLevel {
    pub fn name(self) -> &'static str {
        match self {
            SimdLevel::Fpu => "FPU",
            SimdLevel::Sse => "SSE",
            SimdLevel::Avx => "AVX",
            SimdLevel::Avx2 => "AVX2",
        }
    }
}

/// Detected CPU capabilities relevant to kernel selection.
#[derive(Debug, Clone, Copy, Default)]
struct CpuInfo {
    sse42: bool,
    avx: bool,
    avx2: bool,
    fma: bool,
    f16c: bool,
}

#[cfg(target_arch = "x86_64")]
fn cpu_info() -> CpuInfo {
    CpuInfo {
        sse42: std::arch::is_x86_feature_detected!("sse4.2"),
        avx: std::arch::is_x86_feature_detected!("avx"),
        avx2: std::arch::is_x86_feature_detected!("avx2"),
        fma: std::arch::is_x86_feature_detected!("fma"),
        f16c: std::arch::is_x86_feature_detected!("f16c"),
    }
}

#[cfg(not(target_arch = "x86_64"))]
fn cpu_info() -> CpuInfo {
    CpuInfo::default()
}

/// The selected kernel set plus the load-time encoder tables.
pub struct Kernels {
    level: SimdLevel,
    pub cpu_f16c: bool,
    /// f16 -> f32 software table, present when F16C is unavailable or the
    /// FPU level was selected.
    lut_f16: Option<Box<[f32]>>,
    lut_sf16_from_f16: Box<[u16]>,
    lut_f12_from_f16: Box<[u16]>,
    lut_f12_from_bf16: Box<[u16]>,
    lut_f8_from_f16: Box<[u8]>,
    lut_f8_from_bf16: Box<[u8]>,
}

impl Kernels {
    /// Detect the CPU, resolve the requested SIMD mode (-1 auto, 0 FPU,
    /// 1 SSE, 2 AVX, 3 AVX2), build the encoder tables and run the numeric
    /// self-check.
    pub fn init(simd_mode: i32) -> Result<Kernels> {
        let inf = cpu_info();
        info!(
            "CPU flags: f16c:{} fma:{} sse4.2:{} avx:{} avx2:{}",
            inf.f16c, inf.fma, inf.sse42, inf.avx, inf.avx2
        );

        if cfg!(target_arch = "x86_64") && !inf.sse42 {
            return Err(RtError::Capability("CPU needs SSE4.2 support".into()));
        }

        let mut level = match simd_mode {
            m if m < 0 => SimdLevel::Avx2, // auto, truncated below
            0 => SimdLevel::Fpu,
            1 => SimdLevel::Sse,
            2 => SimdLevel::Avx,
            _ => SimdLevel::Avx2,
        };
        // truncate to detected capability
        if level == SimdLevel::Avx2 && !(inf.avx2 && inf.fma) {
            if simd_mode == 3 {
                warn!("AVX2+FMA not available, falling back");
            }
            level = SimdLevel::Avx;
        }
        if level == SimdLevel::Avx && !inf.avx {
            level = SimdLevel::Sse;
        }
        if !inf.sse42 {
            level = SimdLevel::Fpu;
        }
        info!("simd level: {}", level.name());

        if !inf.f16c {
            info!("CPU has no F16C support, software f16 conversion in use");
        }
        let lut_f16 = if !inf.f16c || level == SimdLevel::Fpu {
            Some(fp16::build_f16_lut())
        } else {
            None
        };

        let kernels = Kernels {
            level,
            cpu_f16c: inf.f16c,
            lut_f16,
            lut_sf16_from_f16: sf16::build_encode_lut()?,
            lut_f12_from_f16: f12::build_encode_lut_f16()?,
            lut_f12_from_bf16: f12::build_encode_lut_bf16()?,
            lut_f8_from_f16: f8::build_encode_lut_f16()?,
            lut_f8_from_bf16: f8::build_encode_lut_bf16()?,
        };

        check::conv_matmul_check(&kernels)?;
        debug!("conv/matmul {} checks done", kernels.level.name());
        Ok(kernels)
    }

    pub fn level(&self) -> SimdLevel {
        self.level
    }

    /// Effective level for a row of `wx` elements: vectorised bodies require
    /// `wx` to be a multiple of [`SIMD_LV`].
    fn row_level(&self, wx: usize) -> SimdLevel {
        if wx % SIMD_LV == 0 {
            self.level
        } else {
            SimdLevel::Fpu
        }
    }

    /// `res[i] = sum_j vec[j] * mat[i][j]` over a row-major `wy`x`wx` matrix
    /// stored in dtype `ty`. `mat` holds exactly `ty.byte_len(wx * wy)` bytes.
    pub fn matmul(&self, ty: WType, res: &mut [f32], vec: &[f32], mat: &[u8], wx: usize, wy: usize) {
        debug_assert!(vec.len() >= wx && res.len() >= wy);
        debug_assert!(mat.len() >= ty.byte_len(wx * wy));
        let lv = self.row_level(wx);
        match ty {
            WType::F32 => match lv {
                SimdLevel::Fpu => fp32::matmul_scalar(res, vec, mat, wx, wy),
                #[cfg(target_arch = "x86_64")]
                SimdLevel::Sse => unsafe { fp32::matmul_sse(res, vec, mat, wx, wy) },
                #[cfg(target_arch = "x86_64")]
                _ => unsafe { fp32::matmul_avx(res, vec, mat, wx, wy) },
                #[cfg(not(target_arch = "x86_64"))]
                _ => fp32::matmul_scalar(res, vec, mat, wx, wy),
            },
            WType::F16 => {
                if let Some(lut) = &self.lut_f16 {
                    fp16::matmul_lut(res, vec, mat, wx, wy, lut);
                } else {
                    match lv {
                        SimdLevel::Fpu => fp16::matmul_soft(res, vec, mat, wx, wy),
                        #[cfg(target_arch = "x86_64")]
                        SimdLevel::Sse => unsafe { fp16::matmul_sse(res, vec, mat, wx, wy) },
                        #[cfg(target_arch = "x86_64")]
                        _ => unsafe { fp16::matmul_avx(res, vec, mat, wx, wy) },
                        #[cfg(not(target_arch = "x86_64"))]
                        _ => fp16::matmul_soft(res, vec, mat, wx, wy),
                    }
                }
            }
            WType::Bf16 => match lv {
                SimdLevel::Fpu => bf16::matmul_scalar(res, vec, mat, wx, wy),
                #[cfg(target_arch = "x86_64")]
                SimdLevel::Avx2 => unsafe { bf16::matmul_avx2(res, vec, mat, wx, wy) },
                #[cfg(target_arch = "x86_64")]
                _ => unsafe { bf16::matmul_sse(res, vec, mat, wx, wy) },
                #[cfg(not(target_arch = "x86_64"))]
                _ => bf16::matmul_scalar(res, vec, mat, wx, wy),
            },
            WType::Sf16 => match lv {
                SimdLevel::Fpu => sf16::matmul_scalar(res, vec, mat, wx, wy),
                #[cfg(target_arch = "x86_64")]
                SimdLevel::Avx2 => unsafe { sf16::matmul_avx2(res, vec, mat, wx, wy) },
                #[cfg(target_arch = "x86_64")]
                _ => unsafe { sf16::matmul_sse(res, vec, mat, wx, wy) },
                #[cfg(not(target_arch = "x86_64"))]
                _ => sf16::matmul_scalar(res, vec, mat, wx, wy),
            },
            WType::F12 => match lv {
                #[cfg(target_arch = "x86_64")]
                SimdLevel::Avx2 => unsafe { f12::matmul_avx2(res, vec, mat, wx, wy) },
                _ => f12::matmul_scalar(res, vec, mat, wx, wy),
            },
            WType::F8 => match lv {
                SimdLevel::Fpu => f8::matmul_scalar(res, vec, mat, wx, wy),
                #[cfg(target_arch = "x86_64")]
                SimdLevel::Avx2 => unsafe { f8::matmul_avx2(res, vec, mat, wx, wy) },
                #[cfg(target_arch = "x86_64")]
                _ => unsafe { f8::matmul_sse(res, vec, mat, wx, wy) },
                #[cfg(not(target_arch = "x86_64"))]
                _ => f8::matmul_scalar(res, vec, mat, wx, wy),
            },
        }
    }

    /// Bulk convert `dst.len()` elements of dtype `ty` into f32.
    /// Supported sources: F32 (copy), F16, BF16, SF16, F12.
    pub fn cvt_to_f32(&self, ty: WType, dst: &mut [f32], src: &[u8]) {
        let ne = dst.len();
        debug_assert!(src.len() >= ty.byte_len(ne));
        match ty {
            WType::F32 => fp32::cvt_copy(dst, src),
            WType::F16 => {
                if let Some(lut) = &self.lut_f16 {
                    fp16::cvt_to_f32_lut(dst, src, lut);
                } else {
                    #[cfg(target_arch = "x86_64")]
                    unsafe {
                        if self.level >= SimdLevel::Avx && ne % 8 == 0 {
                            fp16::cvt_to_f32_avx(dst, src);
                        } else if ne % 4 == 0 {
                            fp16::cvt_to_f32_sse(dst, src);
                        } else {
                            fp16::cvt_to_f32_soft(dst, src);
                        }
                    }
                    #[cfg(not(target_arch = "x86_64"))]
                    fp16::cvt_to_f32_soft(dst, src);
                }
            }
            WType::Bf16 => bf16::cvt_to_f32(dst, src),
            WType::Sf16 => sf16::cvt_to_f32(dst, src),
            WType::F12 => f12::cvt_to_f32(dst, src),
            WType::F8 => f8::cvt_to_f32(dst, src),
        }
    }

    /// Load-time conversion between storage dtypes. The defined pairs are
    /// F16->SF16, F16/BF16->F12 and F16/BF16->F8; everything else is a model
    /// error. Out-of-range source values are a numeric error.
    pub fn convert(
        &self,
        dst_ty: WType,
        src_ty: WType,
        dst: &mut [u8],
        src: &[u8],
        ne: usize,
    ) -> Result<()> {
        match (src_ty, dst_ty) {
            (WType::F16, WType::Sf16) => sf16::encode_from_f16(dst, src, &self.lut_sf16_from_f16),
            (WType::F16, WType::F12) => f12::encode(dst, src, &self.lut_f12_from_f16, f12::F16_MAX, "F16"),
            (WType::Bf16, WType::F12) => f12::encode(dst, src, &self.lut_f12_from_bf16, f12::BF16_MAX, "BF16"),
            (WType::F16, WType::F8) => f8::encode(dst, src, &self.lut_f8_from_f16, f8::F16_MAX, "F16"),
            (WType::Bf16, WType::F8) => f8::encode(dst, src, &self.lut_f8_from_bf16, f8::BF16_MAX, "BF16"),
            _ => {
                let _ = ne;
                Err(RtError::Model(format!(
                    "unsupported weight type conversion: {} to {}",
                    src_ty.name(),
                    dst_ty.name()
                )))
            }
        }
    }

    /// Single-head attention: `xb = softmax(q . K^T / sqrt(head_size)) . V`
    /// over `n_tok` cached positions with row stride `kv_dim`.
    #[allow(clippy::too_many_arguments)]
    pub fn head_attention(
        &self,
        xb: &mut [f32],
        att: &mut [f32],
        q: &[f32],
        k: &[f32],
        v: &[f32],
        n_tok: usize,
        kv_dim: usize,
        head_size: usize,
        sqrt_head_size: f32,
    ) {
        #[cfg(target_arch = "x86_64")]
        if self.level >= SimdLevel::Avx2 && head_size % 8 == 0 {
            unsafe {
                attention::head_att_avx2(xb, att, q, k, v, n_tok, kv_dim, head_size, sqrt_head_size);
            }
            return;
        }
        attention::head_att_scalar(xb, att, q, k, v, n_tok, kv_dim, head_size, sqrt_head_size);
    }
}

/// In-place softmax with max subtraction.
pub fn softmax(x: &mut [f32]) {
    if x.is_empty() {
        return;
    }
    let max = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for v in x.iter_mut() {
        let e = (*v - max).exp();
        *v = e;
        sum += e;
    }
    let inv = 1.0 / sum;
    for v in x.iter_mut() {
        *v *= inv;
    }
}

/// Read a little-endian u16 stream out of a byte slice.
#[inline]
pub(crate) fn u16_at(src: &[u8], i: usize) -> u16 {
    u16::from_le_bytes([src[2 * i], src[2 * i + 1]])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kernels() -> Kernels {
        Kernels::init(-1).expect("kernel init failed")
    }

    #[test]
    fn test_byte_len_f12_packing() {
        assert_eq!(WType::F12.byte_len(16), 24);
        assert_eq!(WType::F12.byte_len(32), 48);
        assert_eq!(WType::F16.byte_len(32), 64);
        assert_eq!(WType::F8.byte_len(32), 32);
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let mut x = [1.0f32, 2.0, 3.0, 4.0];
        softmax(&mut x);
        let sum: f32 = x.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(x[3] > x[2] && x[2] > x[1] && x[1] > x[0]);
    }

    #[test]
    fn test_softmax_large_values_no_overflow() {
        let mut x = [1000.0f32, 1000.0, 999.0];
        softmax(&mut x);
        assert!(x.iter().all(|v| v.is_finite()));
        let sum: f32 = x.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_matmul_f32_tiny() {
        let k = kernels();
        // 2x3 matrix, wx=3 forces the scalar path
        let mat: Vec<u8> = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let vec = [1.0f32, 0.5, 2.0];
        let mut res = [0.0f32; 2];
        k.matmul(WType::F32, &mut res, &vec, &mat, 3, 2);
        assert!((res[0] - 8.0).abs() < 1e-6);
        assert!((res[1] - 18.5).abs() < 1e-6);
    }

    #[test]
    fn test_matmul_f32_simd_matches_scalar() {
        let k = kernels();
        let wx = 64;
        let wy = 4;
        let mut state = 99u64;
        let mut next = || {
            state ^= state >> 12;
            state ^= state << 25;
            state ^= state >> 27;
            ((state.wrapping_mul(0x2545F4914F6CDD1D) >> 32) as u32 >> 8) as f32 / 16777216.0 - 0.5
        };
        let m: Vec<f32> = (0..wx * wy).map(|_| next()).collect();
        let v: Vec<f32> = (0..wx).map(|_| next()).collect();
        let mat: Vec<u8> = m.iter().flat_map(|x| x.to_le_bytes()).collect();

        let mut res_simd = vec![0.0f32; wy];
        k.matmul(WType::F32, &mut res_simd, &v, &mat, wx, wy);
        let mut res_ref = vec![0.0f32; wy];
        fp32::matmul_scalar(&mut res_ref, &v, &mat, wx, wy);
        for (a, b) in res_simd.iter().zip(&res_ref) {
            assert!((a - b).abs() < 1e-4, "simd {a} vs scalar {b}");
        }
    }

    #[test]
    fn test_cvt_bf16_to_f32() {
        let k = kernels();
        // 2.0f32 == 0x40000000, bf16 takes the top 16 bits
        let src = 0x4000u16.to_le_bytes();
        let mut dst = [0.0f32; 1];
        k.cvt_to_f32(WType::Bf16, &mut dst, &src);
        assert_eq!(dst[0], 2.0);
    }

    #[test]
    fn test_convert_rejects_undefined_pair() {
        let k = kernels();
        let src = [0u8; 4];
        let mut dst = [0u8; 4];
        let r = k.convert(WType::Sf16, WType::Bf16, &mut dst, &src, 2);
        assert!(matches!(r, Err(RtError::Model(_))));
    }
}
