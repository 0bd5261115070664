//! Decoder-only transformer forward pass.
//!
//! Pre-norm blocks: RMSNorm, grouped-query attention with rotary position
//! encoding over an in-memory KV cache, SwiGLU feed-forward (dense or
//! mixture-of-experts top-k), final norm and classifier. Matmuls run
//! row-sharded over the worker pool; attention heads are issued in batches
//! sized to the main-node worker count so K/V reads stay local.

mod config;
mod kv_cache;
mod load;

pub use config::{MoeConf, TConf};
pub(crate) use config::{load_model_config, resolve_wd_types};
pub(crate) use load::load_checkpoint_weights;

use crate::config::RunMode;
use crate::error::Result;
use crate::kernels::{Kernels, softmax};
use crate::numa::{ThreadMap, WorkerPool};
use crate::weights::{AlignedF32, WDat};

/// One cached token: its id and whether the model sampled it (false for
/// injected user/prompt tokens).
#[derive(Debug, Clone, Copy, Default)]
pub struct CTok {
    pub token_id: u32,
    pub sampled: bool,
}

/// Per-call execution context: the kernel set and the worker pool.
pub struct ExecCtx<'a> {
    pub kernels: &'a Kernels,
    pub pool: &'a WorkerPool,
    /// Worker count bound to the main-thread node.
    pub nt_mp: usize,
}

/// Raw pointer wrapper for disjoint per-tid writes inside parallel regions.
#[derive(Clone, Copy)]
struct SendPtr(*mut f32);
unsafe impl Send for SendPtr {}
unsafe impl Sync for SendPtr {}

pub struct TWeights {
    pub token_emb: WDat,
    pub rms_att: WDat,
    /// Per-layer inverse frequencies; allocated iff rope_theta is absent.
    pub rope_if: WDat,
    pub wq: WDat,
    pub wk: WDat,
    pub wv: WDat,
    pub wo: WDat,
    /// Qwen2 attention biases; dropped after load when the checkpoint has
    /// none.
    pub bq: WDat,
    pub bk: WDat,
    pub bv: WDat,
    pub rms_ffn: WDat,
    pub w1: WDat,
    pub w2: WDat,
    pub w3: WDat,
    pub rms_final: WDat,
    /// Classifier; unallocated means the token embedding doubles as it.
    pub wcls: WDat,
    pub moe_gate: WDat,
}

pub struct TState {
    pub(crate) x: AlignedF32,
    pub(crate) xb: AlignedF32,
    pub(crate) xb2: AlignedF32,
    pub(crate) hb: AlignedF32,
    pub(crate) hb2: AlignedF32,
    pub(crate) q: AlignedF32,
    pub(crate) k_cache: AlignedF32,
    pub(crate) v_cache: AlignedF32,
    pub(crate) att: AlignedF32,
    pub(crate) logits: Vec<f32>,

    pub(crate) rope_freq: Option<AlignedF32>,
    pub(crate) rope_sin_cos: AlignedF32,

    pub(crate) tokens: Vec<CTok>,
    pub(crate) n_tokens: usize,
    /// Contiguous trailing run of sampled tokens.
    pub(crate) n_tokens_samp: usize,
    /// Prefix kept across resets and compactions (system prompt).
    pub(crate) n_tokens_sys: usize,
    /// Total tokens evicted by compaction, surfaced to the UX.
    pub(crate) n_tokens_del: usize,

    moe_logits: Vec<f32>,
    moe_probs: Vec<(f32, usize)>,
}

pub struct Transformer {
    pub conf: TConf,
    pub weights: TWeights,
    pub(crate) state: TState,
    pub(crate) run_mode: RunMode,
    pub(crate) kv_compact: bool,
    pub(crate) token_eot: u32,
}

impl Transformer {
    /// Allocate weights and run state for `conf`. The checkpoint loader
    /// fills the weights afterwards.
    pub fn build(
        conf: TConf,
        map: &ThreadMap,
        run_mode: RunMode,
        kv_compact: bool,
    ) -> Result<Transformer> {
        let p = &conf;
        let nl = p.n_layers;
        let n_experts = p.moe.map(|m| m.num_experts).unwrap_or(0);
        let nw = if n_experts > 0 { nl * n_experts } else { nl };
        let qy = p.n_heads * p.head_size;
        let kvy = p.n_kv_heads * p.head_size;
        let lw = p.lw_type;
        let em = p.em_type;
        let f32t = crate::kernels::WType::F32;

        let weights = TWeights {
            token_emb: WDat::alloc(map, 1, p.vocab_size, p.dim, em, true)?,
            rms_att: WDat::alloc(map, nl, 1, p.dim, f32t, false)?,
            rope_if: if p.rope_theta == 0.0 {
                WDat::alloc(map, nl, 1, p.head_size / 2, f32t, false)?
            } else {
                WDat::unallocated()
            },
            wq: WDat::alloc(map, nl, qy, p.dim, lw, true)?,
            wk: WDat::alloc(map, nl, kvy, p.dim, lw, true)?,
            wv: WDat::alloc(map, nl, kvy, p.dim, lw, true)?,
            wo: WDat::alloc(map, nl, p.dim, qy, lw, true)?,
            bq: WDat::alloc(map, nl, 1, qy, f32t, false)?,
            bk: WDat::alloc(map, nl, 1, kvy, f32t, false)?,
            bv: WDat::alloc(map, nl, 1, kvy, f32t, false)?,
            rms_ffn: WDat::alloc(map, nl, 1, p.dim, f32t, false)?,
            w1: WDat::alloc(map, nw, p.hidden_dim, p.dim, lw, true)?,
            w2: WDat::alloc(map, nw, p.dim, p.hidden_dim, lw, true)?,
            w3: WDat::alloc(map, nw, p.hidden_dim, p.dim, lw, true)?,
            rms_final: WDat::alloc(map, 1, 1, p.dim, f32t, false)?,
            wcls: WDat::alloc(map, 1, p.vocab_size, p.dim, em, true)?,
            moe_gate: if n_experts > 0 {
                WDat::alloc(map, nl, n_experts, p.dim, lw, true)?
            } else {
                WDat::unallocated()
            },
        };

        let node = map.mt_node;
        let ne_kv = nl * p.seq_len * p.kv_dim;
        let state = TState {
            x: AlignedF32::zeroed(p.dim, node)?,
            xb: AlignedF32::zeroed(p.dim, node)?,
            xb2: AlignedF32::zeroed(p.dim, node)?,
            hb: AlignedF32::zeroed(p.hidden_dim, node)?,
            hb2: AlignedF32::zeroed(p.hidden_dim, node)?,
            q: AlignedF32::zeroed(p.dim, node)?,
            k_cache: AlignedF32::zeroed(ne_kv, node)?,
            v_cache: AlignedF32::zeroed(ne_kv, node)?,
            att: AlignedF32::zeroed(p.n_heads * p.seq_len, node)?,
            logits: vec![0.0; p.vocab_size],
            rope_freq: if p.rope_theta != 0.0 {
                let mut f = AlignedF32::zeroed(p.head_size / 2, node)?;
                init_rope_freq(&mut f, p.rope_theta, p.head_size);
                Some(f)
            } else {
                None
            },
            rope_sin_cos: AlignedF32::zeroed(p.head_size, node)?,
            tokens: vec![CTok::default(); p.seq_len],
            n_tokens: 0,
            n_tokens_samp: 0,
            n_tokens_sys: 0,
            n_tokens_del: 0,
            moe_logits: vec![0.0; n_experts],
            moe_probs: Vec::with_capacity(n_experts),
        };

        Ok(Transformer {
            conf,
            weights,
            state,
            run_mode,
            kv_compact,
            token_eot: 0,
        })
    }

    /// End-of-text token used when the context fills with compaction off.
    pub fn set_token_eot(&mut self, id: u32) {
        self.token_eot = id;
    }

    pub fn n_tokens(&self) -> usize {
        self.state.n_tokens
    }

    pub fn n_tokens_samp(&self) -> usize {
        self.state.n_tokens_samp
    }

    pub fn n_tokens_sys(&self) -> usize {
        self.state.n_tokens_sys
    }

    pub fn n_tokens_del(&self) -> usize {
        self.state.n_tokens_del
    }

    pub fn tokens(&self) -> &[CTok] {
        &self.state.tokens[..self.state.n_tokens]
    }

    pub fn logits(&self) -> &[f32] {
        &self.state.logits
    }

    /// Pin the current cache prefix as the system prompt.
    pub fn mark_sys_prompt(&mut self) {
        self.state.n_tokens_sys = self.state.n_tokens;
    }

    /// Rewind the cache to `n` tokens (dialog regen/forget/reset).
    pub fn rewind(&mut self, n: usize) {
        let s = &mut self.state;
        s.n_tokens = n.min(s.n_tokens);
        s.n_tokens_samp = 0;
        if s.n_tokens_sys > s.n_tokens {
            s.n_tokens_sys = s.n_tokens;
        }
    }

    /// Fill the logits with an end-of-text-only distribution.
    fn force_eot_logits(&mut self) {
        let eot = self.token_eot as usize;
        for l in self.state.logits.iter_mut() {
            *l = 0.0;
        }
        self.state.logits[eot] = 1.0;
    }

    /// One autoregressive step: append `token` to the cache at the next
    /// position and run the decoder. With `want_logits` false only the KV
    /// cache is updated (the last layer stops after rotating K).
    pub fn forward(&mut self, ctx: &ExecCtx, token: u32, is_sampled: bool, want_logits: bool) {
        if self.state.n_tokens == self.conf.seq_len {
            if self.kv_compact {
                self.reserve_kv(self.conf.seq_len / 20);
            }
            if self.state.n_tokens == self.conf.seq_len {
                // nothing could be evicted (or compaction is off)
                self.force_eot_logits();
                return;
            }
        }

        let Transformer {
            ref conf,
            ref weights,
            ref mut state,
            ..
        } = *self;
        let p = conf;
        let w = weights;
        let s = state;

        // token cache update
        let pos = s.n_tokens;
        s.tokens[pos] = CTok {
            token_id: token,
            sampled: is_sampled,
        };
        s.n_tokens += 1;
        if is_sampled {
            s.n_tokens_samp += 1;
        } else {
            s.n_tokens_samp = 0;
        }

        let exit_layer = if want_logits { usize::MAX } else { p.n_layers - 1 };

        if let Some(freq) = &s.rope_freq {
            set_rope_pos(&mut s.rope_sin_cos, pos as i64, freq);
        }

        // token embedding into x
        ctx.kernels
            .cvt_to_f32(w.token_emb.d_type, &mut s.x, w.token_emb.emb_row(token as usize));
        let mut sq_sum = vec_sq_sum(&s.x);

        for l in 0..p.n_layers {
            let def_q = l != exit_layer;

            norm_scale(&mut s.xb, &s.x, sq_sum, p.rms_norm_eps, w.rms_att.row_f32(l));

            let s_kv_ofs = l * p.seq_len * p.kv_dim;
            let kv_pos = s_kv_ofs + pos * p.kv_dim;
            {
                let k = &mut s.k_cache[kv_pos..kv_pos + p.kv_dim];
                let v = &mut s.v_cache[kv_pos..kv_pos + p.kv_dim];

                let q = if def_q { Some(&mut s.q[..]) } else { None };
                compute_qkv(ctx, &w.wq, &w.wk, &w.wv, l, q, k, v, &s.xb);

                if w.bq.is_allocated() {
                    vec_add(k, w.bk.row_f32(l));
                    vec_add(v, w.bv.row_f32(l));
                    if def_q {
                        vec_add(&mut s.q, w.bq.row_f32(l));
                    }
                }

                if s.rope_freq.is_none() {
                    set_rope_pos(&mut s.rope_sin_cos, pos as i64, w.rope_if.row_f32(l));
                }

                if !def_q {
                    // token injection: the cache only needs K in place
                    rope_rotate(k, None, &s.rope_sin_cos, p.head_size);
                    return;
                }
                rope_rotate(&mut s.q, Some(k), &s.rope_sin_cos, p.head_size);
            }

            multihead_attention(
                ctx,
                p,
                s.n_tokens,
                s_kv_ofs,
                &mut s.xb,
                &mut s.att,
                &s.q,
                &s.k_cache,
                &s.v_cache,
            );

            lw_matmul(ctx, &mut s.xb2, &s.xb, &w.wo, l);
            sq_sum = vec_add_sq_sum(&mut s.x, &s.xb2);

            norm_scale(&mut s.xb, &s.x, sq_sum, p.rms_norm_eps, w.rms_ffn.row_f32(l));

            match p.moe {
                None => {
                    compute_ffn_gate(ctx, &w.w1, &w.w3, l, &mut s.hb, &mut s.hb2, &s.xb);
                    lw_matmul(ctx, &mut s.xb, &s.hb, &w.w2, l);
                    sq_sum = vec_add_sq_sum(&mut s.x, &s.xb);
                }
                Some(moe) => {
                    lw_matmul(ctx, &mut s.moe_logits, &s.xb, &w.moe_gate, l);
                    softmax(&mut s.moe_logits);

                    s.moe_probs.clear();
                    s.moe_probs
                        .extend(s.moe_logits.iter().enumerate().map(|(i, &pr)| (pr, i)));
                    s.moe_probs.sort_unstable_by(|a, b| b.0.total_cmp(&a.0));

                    let sum_prob: f32 = s.moe_probs[..moe.top_k].iter().map(|e| e.0).sum();

                    for e in 0..moe.top_k {
                        let (prob, exp_id) = s.moe_probs[e];
                        let z = l * moe.num_experts + exp_id;
                        compute_ffn_gate(ctx, &w.w1, &w.w3, z, &mut s.hb, &mut s.hb2, &s.xb);
                        lw_matmul(ctx, &mut s.xb2, &s.hb, &w.w2, z);
                        let scale = prob / sum_prob;
                        for (xj, dj) in s.x.iter_mut().zip(s.xb2.iter()) {
                            *xj += dj * scale;
                        }
                    }
                    sq_sum = vec_sq_sum(&s.x);
                }
            }
        }

        norm_scale_inplace(&mut s.x, sq_sum, p.rms_norm_eps, w.rms_final.row_f32(0));

        let cls = if w.wcls.is_allocated() { &w.wcls } else { &w.token_emb };
        lw_matmul(ctx, &mut s.logits, &s.x, cls, 0);
    }
}

// ---------------------------------------------------------------------------
// sharded linear algebra over the worker pool

/// `dst = wd[z] . src`, rows split over the worker tids.
pub(crate) fn lw_matmul(ctx: &ExecCtx, dst: &mut [f32], src: &[f32], wd: &WDat, z: usize) {
    debug_assert!(dst.len() >= wd.wy);
    let kernels = ctx.kernels;
    let out = SendPtr(dst.as_mut_ptr());
    ctx.pool.parallel_for(wd.n_parts(), |tid| {
        let out = out;
        let rows = wd.rows_of(tid);
        if rows == 0 {
            return;
        }
        let y = tid * wd.dy;
        let d = unsafe { std::slice::from_raw_parts_mut(out.0.add(y), rows) };
        kernels.matmul(wd.d_type, d, src, wd.part_slice(tid, z), wd.wx, rows);
    });
}

/// Q/K/V projections in a single region; each tid computes its rows of all
/// three so one worker touches one shard set.
#[allow(clippy::too_many_arguments)]
fn compute_qkv(
    ctx: &ExecCtx,
    wq: &WDat,
    wk: &WDat,
    wv: &WDat,
    z: usize,
    q: Option<&mut [f32]>,
    k: &mut [f32],
    v: &mut [f32],
    src: &[f32],
) {
    let kernels = ctx.kernels;
    let kp = SendPtr(k.as_mut_ptr());
    let vp = SendPtr(v.as_mut_ptr());
    let qp = q.map(|q| SendPtr(q.as_mut_ptr()));

    ctx.pool.parallel_for(wk.n_parts(), |tid| {
        let kp = kp;
        let vp = vp;
        let qp = qp;
        let rows = wk.rows_of(tid);
        if rows > 0 {
            let y = tid * wk.dy;
            let d = unsafe { std::slice::from_raw_parts_mut(kp.0.add(y), rows) };
            kernels.matmul(wk.d_type, d, src, wk.part_slice(tid, z), wk.wx, rows);
            let d = unsafe { std::slice::from_raw_parts_mut(vp.0.add(y), rows) };
            kernels.matmul(wv.d_type, d, src, wv.part_slice(tid, z), wv.wx, rows);
        }
        if let Some(qp) = qp {
            let rows = wq.rows_of(tid);
            if rows > 0 {
                let y = tid * wq.dy;
                let d = unsafe { std::slice::from_raw_parts_mut(qp.0.add(y), rows) };
                kernels.matmul(wq.d_type, d, src, wq.part_slice(tid, z), wq.wx, rows);
            }
        }
    });
}

/// W1/W3 projections plus the SwiGLU gate, each tid on its own rows.
fn compute_ffn_gate(
    ctx: &ExecCtx,
    w1: &WDat,
    w3: &WDat,
    z: usize,
    hb: &mut [f32],
    hb2: &mut [f32],
    src: &[f32],
) {
    let kernels = ctx.kernels;
    let hp = SendPtr(hb.as_mut_ptr());
    let hp2 = SendPtr(hb2.as_mut_ptr());
    ctx.pool.parallel_for(w1.n_parts(), |tid| {
        let hp = hp;
        let hp2 = hp2;
        let rows = w1.rows_of(tid);
        if rows == 0 {
            return;
        }
        let y = tid * w1.dy;
        let d1 = unsafe { std::slice::from_raw_parts_mut(hp.0.add(y), rows) };
        kernels.matmul(w1.d_type, d1, src, w1.part_slice(tid, z), w1.wx, rows);
        let d3 = unsafe { std::slice::from_raw_parts_mut(hp2.0.add(y), rows) };
        kernels.matmul(w3.d_type, d3, src, w3.part_slice(tid, z), w3.wx, rows);
        for (a, b) in d1.iter_mut().zip(d3.iter()) {
            *a = swiglu(*a) * *b;
        }
    });
}

/// All heads of one position, issued `nt_mp` at a time so workers read K/V
/// owned by the main-thread node.
#[allow(clippy::too_many_arguments)]
fn multihead_attention(
    ctx: &ExecCtx,
    p: &TConf,
    n_tok: usize,
    s_kv_ofs: usize,
    xb: &mut [f32],
    att: &mut [f32],
    q: &[f32],
    k_cache: &[f32],
    v_cache: &[f32],
) {
    let kernels = ctx.kernels;
    let xp = SendPtr(xb.as_mut_ptr());
    let ap = SendPtr(att.as_mut_ptr());
    let batch = ctx.nt_mp.max(1);

    let mut h0 = 0;
    while h0 < p.n_heads {
        let nt = (p.n_heads - h0).min(batch);
        ctx.pool.parallel_for(nt, |tid| {
            let xp = xp;
            let ap = ap;
            let h = h0 + tid;
            let xb_h = unsafe { std::slice::from_raw_parts_mut(xp.0.add(h * p.head_size), p.head_size) };
            let att_h = unsafe { std::slice::from_raw_parts_mut(ap.0.add(h * p.seq_len), n_tok) };
            let q_h = &q[h * p.head_size..(h + 1) * p.head_size];
            let kv_ofs = s_kv_ofs + (h / p.kv_mul) * p.head_size;
            let kv_len = (n_tok - 1) * p.kv_dim + p.head_size;
            let k_h = &k_cache[kv_ofs..kv_ofs + kv_len];
            let v_h = &v_cache[kv_ofs..kv_ofs + kv_len];
            kernels.head_attention(
                xb_h,
                att_h,
                q_h,
                k_h,
                v_h,
                n_tok,
                p.kv_dim,
                p.head_size,
                p.sqrt_head_size,
            );
        });
        h0 += nt;
    }
}

// ---------------------------------------------------------------------------
// block math

#[inline]
fn swiglu(x: f32) -> f32 {
    x / (1.0 + (-x).exp())
}

fn vec_add(a: &mut [f32], b: &[f32]) {
    for (x, y) in a.iter_mut().zip(b) {
        *x += y;
    }
}

fn vec_sq_sum(a: &[f32]) -> f32 {
    a.iter().map(|x| x * x).sum()
}

/// `a += b`, returning the sum of squares of the result.
fn vec_add_sq_sum(a: &mut [f32], b: &[f32]) -> f32 {
    let mut sq = 0.0f32;
    for (x, y) in a.iter_mut().zip(b) {
        let s = *x + y;
        *x = s;
        sq += s * s;
    }
    sq
}

/// RMS-normalise `a` into `o` and scale by `weight`.
fn norm_scale(o: &mut [f32], a: &[f32], sq_sum: f32, eps: f32, weight: &[f32]) {
    let k = 1.0 / ((sq_sum / a.len() as f32) + eps).sqrt();
    for ((d, s), w) in o.iter_mut().zip(a).zip(weight) {
        *d = (s * k) * w;
    }
}

fn norm_scale_inplace(a: &mut [f32], sq_sum: f32, eps: f32, weight: &[f32]) {
    let k = 1.0 / ((sq_sum / a.len() as f32) + eps).sqrt();
    for (x, w) in a.iter_mut().zip(weight) {
        *x = (*x * k) * w;
    }
}

/// Inverse frequency table for a rope_theta base.
pub(crate) fn init_rope_freq(freq: &mut [f32], rope_theta: f32, head_size: usize) {
    for (i, f) in freq.iter_mut().enumerate() {
        *f = (1.0 / (rope_theta as f64).powf((2 * i) as f64 / head_size as f64)) as f32;
    }
}

/// Interleaved sin/cos pairs for a (possibly negative) position.
pub(crate) fn set_rope_pos(sin_cos: &mut [f32], pos: i64, freq: &[f32]) {
    for (i, f) in freq.iter().enumerate() {
        let v = f * pos as f32;
        sin_cos[2 * i] = v.sin();
        sin_cos[2 * i + 1] = v.cos();
    }
}

/// Rotate `a` (and the prefix of `b` it overlaps) pairwise by the angles in
/// `sin_cos`, cycling per head.
pub(crate) fn rope_rotate(a: &mut [f32], b: Option<&mut [f32]>, sin_cos: &[f32], head_size: usize) {
    let b_len = b.as_ref().map(|b| b.len()).unwrap_or(0);
    let mut b = b;
    let mut i = 0;
    while i < a.len() {
        let j = i % head_size;
        let s = sin_cos[j];
        let c = sin_cos[j + 1];
        let x = a[i];
        let y = a[i + 1];
        a[i] = x * c - y * s;
        a[i + 1] = x * s + y * c;
        if i < b_len
            && let Some(b) = b.as_deref_mut()
        {
            let x = b[i];
            let y = b[i + 1];
            b[i] = x * c - y * s;
            b[i + 1] = x * s + y * c;
        }
        i += 2;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_swiglu() {
        assert_eq!(swiglu(0.0), 0.0);
        // large x ~ x, large negative ~ 0
        assert!((swiglu(20.0) - 20.0).abs() < 1e-3);
        assert!(swiglu(-20.0).abs() < 1e-3);
    }

    #[test]
    fn test_norm_scale_unit_weight() {
        let a = [2.0f32, 2.0, 2.0, 2.0];
        let w = [1.0f32; 4];
        let mut o = [0.0f32; 4];
        let sq = vec_sq_sum(&a);
        norm_scale(&mut o, &a, sq, 0.0, &w);
        // rms of the vector is 2, so the output is all ones
        for v in o {
            assert!((v - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_vec_add_sq_sum() {
        let mut a = [1.0f32, 2.0];
        let b = [2.0f32, 1.0];
        let sq = vec_add_sq_sum(&mut a, &b);
        assert_eq!(a, [3.0, 3.0]);
        assert_eq!(sq, 18.0);
    }

    #[test]
    fn test_rope_zero_pos_is_identity() {
        let freq = [1.0f32, 0.5];
        let mut sin_cos = [0.0f32; 4];
        set_rope_pos(&mut sin_cos, 0, &freq);
        let mut a = [1.0f32, 2.0, 3.0, 4.0];
        rope_rotate(&mut a, None, &sin_cos, 4);
        assert_eq!(a, [1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_rope_rotation_invertible() {
        let freq = [0.7f32, 0.3];
        let mut sin_cos = [0.0f32; 4];
        let orig = [1.0f32, 2.0, 3.0, 4.0];
        let mut a = orig;

        set_rope_pos(&mut sin_cos, 5, &freq);
        rope_rotate(&mut a, None, &sin_cos, 4);
        set_rope_pos(&mut sin_cos, -5, &freq);
        rope_rotate(&mut a, None, &sin_cos, 4);

        for (x, y) in a.iter().zip(&orig) {
            assert!((x - y).abs() < 1e-5, "{a:?}");
        }
    }

    #[test]
    fn test_rope_rotates_b_prefix() {
        let freq = [0.7f32, 0.3];
        let mut sin_cos = [0.0f32; 4];
        set_rope_pos(&mut sin_cos, 3, &freq);

        let mut a = [1.0f32; 8];
        let mut b = [1.0f32; 4];
        let b_expected = {
            let mut t = [1.0f32; 4];
            rope_rotate(&mut t, None, &sin_cos, 4);
            t
        };
        rope_rotate(&mut a, Some(&mut b), &sin_cos, 4);
        assert_eq!(b, b_expected);
        // both head groups of a rotate with the same angles
        assert_eq!(a[0], a[4]);
        assert_eq!(a[1], a[5]);
    }

    #[test]
    fn test_init_rope_freq_decreasing() {
        let mut f = [0.0f32; 4];
        init_rope_freq(&mut f, 10000.0, 8);
        assert_eq!(f[0], 1.0);
        for i in 1..4 {
            assert!(f[i] < f[i - 1]);
            assert!(f[i] > 0.0);
        }
    }
}
