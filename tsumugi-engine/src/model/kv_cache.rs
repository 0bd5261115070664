//! KV cache compaction.
//!
//! Recovers context room by forgetting the oldest tokens: whole dialog
//! turns after the system prompt in chat mode, a plain prefix in generate
//! mode. Surviving K entries are rotated by the negative of the eviction
//! count so their positional encoding matches the compacted positions; V
//! carries no position and is moved as-is.

use super::{Transformer, rope_rotate, set_rope_pos};
use crate::config::RunMode;
use tracing::debug;

impl Transformer {
    /// Make room for at least `min_token_reserve` tokens, evicting old
    /// cache entries if needed. Returns the number of evicted tokens.
    pub fn reserve_kv(&mut self, min_token_reserve: usize) -> usize {
        let prev = self.state.n_tokens;
        let left = self.conf.seq_len - prev;
        if left < min_token_reserve {
            self.reduce_kv(min_token_reserve - left);
            return prev - self.state.n_tokens;
        }
        0
    }

    fn reduce_kv(&mut self, min_tokens_delete: usize) {
        let Transformer {
            ref conf,
            ref weights,
            ref mut state,
            run_mode,
            ..
        } = *self;
        let p = conf;
        let s = state;

        let n_ctx = s.n_tokens;
        let min_del = n_ctx / 20; // eviction floor, 5% of the context

        let (i0, first_kept) = match run_mode {
            RunMode::Generate => (0, min_tokens_delete.max(min_del).min(n_ctx)),
            RunMode::Chat => {
                let want = min_tokens_delete.max(min_del);
                let i0 = s.n_tokens_sys;
                let mut i = i0;
                while i < n_ctx {
                    // pass one user entry, then one model reply
                    while i < n_ctx && !s.tokens[i].sampled {
                        i += 1;
                    }
                    while i < n_ctx && s.tokens[i].sampled {
                        i += 1;
                    }
                    if i - i0 >= want {
                        break;
                    }
                }
                (i0, i)
            }
        };

        let n_del = first_kept - i0;
        if n_del == 0 {
            return;
        }
        s.n_tokens_del += n_del;
        debug!("kv cache: evicting {n_del} tokens at {i0}");

        // rotate surviving K rows by -n_del and close the hole
        for l in 0..p.n_layers {
            match &s.rope_freq {
                Some(freq) => set_rope_pos(&mut s.rope_sin_cos, -(n_del as i64), freq),
                None => set_rope_pos(
                    &mut s.rope_sin_cos,
                    -(n_del as i64),
                    weights.rope_if.row_f32(l),
                ),
            }
            let base = l * p.seq_len * p.kv_dim;
            for (dst, src) in (i0..).zip(first_kept..n_ctx) {
                let s_ofs = base + src * p.kv_dim;
                let d_ofs = base + dst * p.kv_dim;
                rope_rotate(
                    &mut s.k_cache[s_ofs..s_ofs + p.kv_dim],
                    None,
                    &s.rope_sin_cos,
                    p.head_size,
                );
                s.k_cache.copy_within(s_ofs..s_ofs + p.kv_dim, d_ofs);
                s.v_cache.copy_within(s_ofs..s_ofs + p.kv_dim, d_ofs);
            }
        }

        // compact the token history
        s.n_tokens = i0;
        s.n_tokens_samp = 0;
        for src in first_kept..n_ctx {
            let ct = s.tokens[src];
            s.tokens[s.n_tokens] = ct;
            s.n_tokens += 1;
            if ct.sampled {
                s.n_tokens_samp += 1;
            } else {
                s.n_tokens_samp = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::{CTok, TConf, Transformer, set_rope_pos};
    use crate::config::RunMode;
    use crate::kernels::WType;
    use crate::numa::{ThreadMap, Topology};

    fn tiny_conf() -> TConf {
        TConf {
            dim: 8,
            hidden_dim: 16,
            n_layers: 1,
            n_heads: 2,
            n_kv_heads: 2,
            seq_len: 8,
            rms_norm_eps: 1e-5,
            rope_theta: 10000.0,
            vocab_size: 4,
            torch_type: WType::F32,
            head_size: 4,
            kv_dim: 8,
            kv_mul: 1,
            sqrt_head_size: 2.0,
            em_type: WType::F32,
            lw_type: WType::F32,
            cvt_sf16: false,
            cvt_f12: false,
            cvt_f8: false,
            moe: None,
        }
    }

    fn tiny_transformer(mode: RunMode) -> Transformer {
        let topo = Topology::fallback();
        let map = ThreadMap::new(&topo, 1, 1);
        Transformer::build(tiny_conf(), &map, mode, true).unwrap()
    }

    fn push(t: &mut Transformer, sampled: bool) {
        let s = &mut t.state;
        let pos = s.n_tokens;
        s.tokens[pos] = CTok {
            token_id: pos as u32,
            sampled,
        };
        s.n_tokens += 1;
        if sampled {
            s.n_tokens_samp += 1;
        } else {
            s.n_tokens_samp = 0;
        }
        // distinctive K rows: position index in every lane
        let kv_dim = t.conf.kv_dim;
        for v in s.k_cache[pos * kv_dim..(pos + 1) * kv_dim].iter_mut() {
            *v = pos as f32;
        }
        for v in s.v_cache[pos * kv_dim..(pos + 1) * kv_dim].iter_mut() {
            *v = 100.0 + pos as f32;
        }
    }

    /// Chat cache [S,S,U,U,A,A,A,A]: one whole turn after the system prompt
    /// is evicted and the survivors slide down.
    #[test]
    fn test_chat_compaction_drops_whole_turn() {
        let mut t = tiny_transformer(RunMode::Chat);
        push(&mut t, false); // S
        push(&mut t, false); // S
        t.mark_sys_prompt();
        push(&mut t, false); // U
        push(&mut t, false); // U
        for _ in 0..4 {
            push(&mut t, true); // A
        }
        assert_eq!(t.n_tokens(), 8);

        let deleted = t.reserve_kv(3);
        assert_eq!(deleted, 6); // U,U,A,A,A,A is one full turn
        assert_eq!(t.n_tokens(), 2);
        assert_eq!(t.n_tokens_sys(), 2);
        assert_eq!(t.n_tokens_del(), 6);
        // the system prompt K rows are untouched
        assert_eq!(t.state.k_cache[0], 0.0);
        assert_eq!(t.state.k_cache[t.conf.kv_dim], 1.0);
    }

    /// A second turn survives when the first one satisfies the reserve, and
    /// its K rows land rotated by -n_del.
    #[test]
    fn test_chat_compaction_keeps_later_turn() {
        let mut t = tiny_transformer(RunMode::Chat);
        push(&mut t, false); // S
        push(&mut t, false); // S
        t.mark_sys_prompt();
        push(&mut t, false); // U1
        push(&mut t, true); //  A1
        push(&mut t, true); //  A1
        push(&mut t, false); // U2
        push(&mut t, true); //  A2
        assert_eq!(t.n_tokens(), 7);

        let deleted = t.reserve_kv(3);
        assert_eq!(deleted, 3); // only the first turn goes
        assert_eq!(t.n_tokens(), 4);
        // survivors: S,S then U2,A2 with ids 5,6
        assert_eq!(t.tokens()[2].token_id, 5);
        assert_eq!(t.tokens()[3].token_id, 6);
        assert_eq!(t.n_tokens_samp(), 1);

        // V moved without rotation
        assert_eq!(t.state.v_cache[2 * t.conf.kv_dim], 105.0);

        // K moved and rotated by -3: undo the rotation to recover the row
        let kv_dim = t.conf.kv_dim;
        let mut row: Vec<f32> = t.state.k_cache[2 * kv_dim..3 * kv_dim].to_vec();
        let freq: Vec<f32> = t.state.rope_freq.as_ref().unwrap().to_vec();
        let mut sin_cos = vec![0.0f32; t.conf.head_size];
        set_rope_pos(&mut sin_cos, 3, &freq);
        super::super::rope_rotate(&mut row, None, &sin_cos, t.conf.head_size);
        for v in row {
            assert!((v - 5.0).abs() < 1e-4, "got {v}");
        }
    }

    #[test]
    fn test_generate_compaction_drops_prefix() {
        let mut t = tiny_transformer(RunMode::Generate);
        for _ in 0..8 {
            push(&mut t, true);
        }
        let deleted = t.reserve_kv(2);
        assert!(deleted >= 2, "deleted {deleted}");
        assert_eq!(t.n_tokens(), 8 - deleted);
        // survivors keep their order
        assert_eq!(t.tokens()[0].token_id, deleted as u32);
    }

    #[test]
    fn test_reserve_noop_when_room_left() {
        let mut t = tiny_transformer(RunMode::Chat);
        push(&mut t, false);
        assert_eq!(t.reserve_kv(3), 0);
        assert_eq!(t.n_tokens(), 1);
    }
}
