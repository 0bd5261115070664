//! Init-time numeric self-check.
//!
//! Multiplies a seeded random matrix against a random vector in every dtype
//! and compares with the scalar f32 reference. Error bounds are the
//! documented per-dtype tolerances on a 4096-wide dot of unit-variance
//! values; exceeding them means a broken kernel or encoder on this CPU.

use super::{Kernels, WType, fp32};
use crate::error::{Result, RtError};
use crate::rng::XorShift;
use half::f16;

const WX: usize = 4096;
const WY: usize = 200;

struct Bounds {
    e_max: f32,
    e_sum: f32,
}

// observed maxima on the documented 4096-wide unit-variance dot are roughly
// 0.65 element error for the 16/12-bit formats and 6.8 for f8; the gate
// carries ~1.5x headroom so a fresh weight sample cannot trip it
const B_F32: Bounds = Bounds { e_max: 0.005, e_sum: 0.5 };
const B_16: Bounds = Bounds { e_max: 1.0, e_sum: 65.0 };
const B_F8: Bounds = Bounds { e_max: 10.0, e_sum: 550.0 };

fn check_error(reference: &[f32], result: &[f32], b: &Bounds, what: &str) -> Result<()> {
    let mut e_max = 0.0f32;
    let mut e_sum = 0.0f32;
    for (a, r) in reference.iter().zip(result) {
        let err = (a - r).abs();
        e_sum += err;
        if err > e_max {
            e_max = err;
        }
    }
    if e_max > b.e_max || e_sum > b.e_sum {
        return Err(RtError::Numeric(format!(
            "kernel check {what}: e_max {e_max:.5} e_sum {e_sum:.5}"
        )));
    }
    Ok(())
}

pub fn conv_matmul_check(k: &Kernels) -> Result<()> {
    let mut rng = XorShift::new(543);
    let ne = WX * WY;

    let v: Vec<f32> = (0..WX).map(|_| rng.next_f32_signed() * 2.0).collect();
    let w: Vec<f32> = (0..ne).map(|_| rng.next_f32_signed() * 2.0).collect();
    let w_bytes: Vec<u8> = w.iter().flat_map(|x| x.to_le_bytes()).collect();

    // scalar f32 reference
    let mut res_ref = vec![0.0f32; WY];
    fp32::matmul_scalar(&mut res_ref, &v, &w_bytes, WX, WY);

    let mut res = vec![0.0f32; WY];

    // f32, selected level
    k.matmul(WType::F32, &mut res, &v, &w_bytes, WX, WY);
    check_error(&res_ref, &res, &B_F32, "f32 mul")?;

    // bf16: quantise (truncate), convert back and multiply directly
    let w_bf16: Vec<u8> = w
        .iter()
        .flat_map(|x| ((x.to_bits() >> 16) as u16).to_le_bytes())
        .collect();
    let mut w_f32 = vec![0.0f32; ne];
    k.cvt_to_f32(WType::Bf16, &mut w_f32, &w_bf16);
    let cvt_bytes: Vec<u8> = w_f32.iter().flat_map(|x| x.to_le_bytes()).collect();
    k.matmul(WType::F32, &mut res, &v, &cvt_bytes, WX, WY);
    check_error(&res_ref, &res, &B_16, "bf16 cvt")?;
    k.matmul(WType::Bf16, &mut res, &v, &w_bf16, WX, WY);
    check_error(&res_ref, &res, &B_16, "bf16 mul")?;

    // f16
    let w_f16: Vec<u8> = w
        .iter()
        .flat_map(|x| f16::from_f32(*x).to_bits().to_le_bytes())
        .collect();
    k.cvt_to_f32(WType::F16, &mut w_f32, &w_f16);
    let cvt_bytes: Vec<u8> = w_f32.iter().flat_map(|x| x.to_le_bytes()).collect();
    k.matmul(WType::F32, &mut res, &v, &cvt_bytes, WX, WY);
    check_error(&res_ref, &res, &B_16, "f16 cvt")?;
    k.matmul(WType::F16, &mut res, &v, &w_f16, WX, WY);
    check_error(&res_ref, &res, &B_16, "f16 mul")?;

    // sf16 from f16
    let mut w_sf16 = vec![0u8; ne * 2];
    k.convert(WType::Sf16, WType::F16, &mut w_sf16, &w_f16, ne)?;
    k.matmul(WType::Sf16, &mut res, &v, &w_sf16, WX, WY);
    check_error(&res_ref, &res, &B_16, "sf16 mul")?;

    // f12 from both sources
    let mut w_f12 = vec![0u8; WType::F12.byte_len(ne)];
    k.convert(WType::F12, WType::Bf16, &mut w_f12, &w_bf16, ne)?;
    k.matmul(WType::F12, &mut res, &v, &w_f12, WX, WY);
    check_error(&res_ref, &res, &B_16, "f12 mul bf16")?;
    k.convert(WType::F12, WType::F16, &mut w_f12, &w_f16, ne)?;
    k.matmul(WType::F12, &mut res, &v, &w_f12, WX, WY);
    check_error(&res_ref, &res, &B_16, "f12 mul f16")?;

    // f8 from both sources
    let mut w_f8 = vec![0u8; ne];
    k.convert(WType::F8, WType::Bf16, &mut w_f8, &w_bf16, ne)?;
    k.matmul(WType::F8, &mut res, &v, &w_f8, WX, WY);
    check_error(&res_ref, &res, &B_F8, "f8 mul bf16")?;
    k.convert(WType::F8, WType::F16, &mut w_f8, &w_f16, ne)?;
    k.matmul(WType::F8, &mut res, &v, &w_f8, WX, WY);
    check_error(&res_ref, &res, &B_F8, "f8 mul f16")?;

    Ok(())
}
