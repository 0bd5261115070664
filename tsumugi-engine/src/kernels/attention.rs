//! Single-head attention inner loop.
//!
//! Scores every cached position against the head's query, applies a
//! max-subtracted softmax with the 1/sqrt(head_size) scale inside the
//! exponent, then accumulates the weighted value rows.

pub fn head_att_scalar(
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
    let mut att_max = -1e10f32;
    for t in 0..n_tok {
        let kt = &k[t * kv_dim..t * kv_dim + head_size];
        let mut dot = 0.0f32;
        for (qi, ki) in q.iter().take(head_size).zip(kt) {
            dot += qi * ki;
        }
        att[t] = dot;
        if dot > att_max {
            att_max = dot;
        }
    }

    let mut att_e_sum = 0.0f32;
    for a in att.iter_mut().take(n_tok) {
        let e = ((*a - att_max) / sqrt_head_size).exp();
        *a = e;
        att_e_sum += e;
    }

    for t in 0..n_tok {
        let a = att[t] / att_e_sum;
        let vt = &v[t * kv_dim..t * kv_dim + head_size];
        if t == 0 {
            for (x, vi) in xb.iter_mut().take(head_size).zip(vt) {
                *x = a * vi;
            }
        } else {
            for (x, vi) in xb.iter_mut().take(head_size).zip(vt) {
                *x += a * vi;
            }
        }
    }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2", enable = "fma")]
#[allow(clippy::too_many_arguments)]
pub unsafe fn head_att_avx2(
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
    use super::hsum::hsum_ps_avx;
    use std::arch::x86_64::*;
    unsafe {
        let qp = q.as_ptr();
        let kp = k.as_ptr();
        let vp = v.as_ptr();
        let xp = xb.as_mut_ptr();

        let mut att_max = -1e10f32;
        for t in 0..n_tok {
            let m = kp.add(t * kv_dim);
            let mut acc = _mm256_setzero_ps();
            let mut i = 0;
            while i != head_size {
                acc = _mm256_fmadd_ps(_mm256_loadu_ps(qp.add(i)), _mm256_loadu_ps(m.add(i)), acc);
                i += 8;
            }
            let r = hsum_ps_avx(acc);
            att[t] = r;
            if r > att_max {
                att_max = r;
            }
        }

        let mut att_e_sum = 0.0f32;
        for a in att.iter_mut().take(n_tok) {
            let e = ((*a - att_max) / sqrt_head_size).exp();
            *a = e;
            att_e_sum += e;
        }

        for t in 0..n_tok {
            let a = _mm256_set1_ps(att[t] / att_e_sum);
            let m = vp.add(t * kv_dim);
            let mut j = 0;
            if t == 0 {
                while j != head_size {
                    _mm256_storeu_ps(xp.add(j), _mm256_mul_ps(a, _mm256_loadu_ps(m.add(j))));
                    j += 8;
                }
            } else {
                while j != head_size {
                    _mm256_storeu_ps(
                        xp.add(j),
                        _mm256_fmadd_ps(a, _mm256_loadu_ps(m.add(j)), _mm256_loadu_ps(xp.add(j))),
                    );
                    j += 8;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_position_copies_value() {
        // one cached token: softmax over one score is 1, xb = v row
        let q = [1.0f32, 0.0, 0.0, 0.0];
        let k = [0.5f32, 0.0, 0.0, 0.0];
        let v = [3.0f32, -1.0, 2.0, 0.5];
        let mut xb = [0.0f32; 4];
        let mut att = [0.0f32; 1];
        head_att_scalar(&mut xb, &mut att, &q, &k, &v, 1, 4, 4, 2.0);
        assert_eq!(xb, v);
    }

    #[test]
    fn test_two_positions_weighting() {
        // head_size 1, kv_dim 1, scale 1: scores q*k = [0, ln(3)]
        // softmax -> [1/4, 3/4]; xb = 0.25*v0 + 0.75*v1
        let q = [1.0f32];
        let k = [0.0f32, 3.0f32.ln()];
        let v = [4.0f32, 8.0];
        let mut xb = [0.0f32; 1];
        let mut att = [0.0f32; 2];
        head_att_scalar(&mut xb, &mut att, &q, &k, &v, 2, 1, 1, 1.0);
        assert!((xb[0] - 7.0).abs() < 1e-5);
    }

    #[test]
    fn test_large_scores_no_overflow() {
        let q = [100.0f32];
        let k = [1000.0f32, 999.0];
        let v = [1.0f32, 2.0];
        let mut xb = [0.0f32; 1];
        let mut att = [0.0f32; 2];
        head_att_scalar(&mut xb, &mut att, &q, &k, &v, 2, 1, 1, 1.0);
        assert!(xb[0].is_finite());
    }
}
