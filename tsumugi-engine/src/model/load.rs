//! Checkpoint weight loading (safetensors container).
//!
//! Each file is an 8-byte little-endian header length, a JSON map of tensor
//! name to `{dtype, shape, data_offsets}`, then the raw payloads. Tensors
//! are validated against the allocated `WDat` geometry, converted to the
//! memory dtype when a conversion is configured, un-permuted for Q/K, and
//! streamed row-sharded into their memory nodes.

use super::Transformer;
use crate::config::RunConfig;
use crate::error::{Result, RtError};
use crate::kernels::{Kernels, WType};
use crate::weights::WDat;
use serde::Deserialize;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use tracing::{info, warn};

const MAX_HEADER: u64 = 16 * 1024 * 1024;

#[derive(Deserialize)]
struct TensorInfo {
    dtype: String,
    shape: Vec<usize>,
    data_offsets: [u64; 2],
}

fn dtype_of(s: &str) -> Result<WType> {
    match s {
        "F16" => Ok(WType::F16),
        "BF16" => Ok(WType::Bf16),
        "F32" => Ok(WType::F32),
        d => Err(RtError::Model(format!("unsupported tensor storage format {d}"))),
    }
}

/// `(wy, wx)` of a 1-D or 2-D tensor.
fn shape_of(name: &str, ti: &TensorInfo) -> Result<(usize, usize)> {
    match ti.shape.as_slice() {
        [n] => Ok((1, *n)),
        [y, x] => Ok((*y, *x)),
        s => Err(RtError::Model(format!("{name}: tensor rank {} unsupported", s.len()))),
    }
}

/// Undo the HuggingFace Q/K reshape
/// `view(y, x).reshape(n_heads, y/n_heads/2, 2, x).transpose(1, 2)` so RoPE
/// can consume adjacent lane pairs.
fn inv_permute_qk(dst: &mut [u8], src: &[u8], unit: usize, count: usize, n_heads: usize) {
    let na = n_heads;
    let nb = (count / n_heads) / 2;
    let nc = 2;
    let mut w = 0;
    for a in 0..na {
        for b in 0..nb {
            for c in 0..nc {
                let id = ((a * nc + c) * nb + b) * unit;
                dst[w..w + unit].copy_from_slice(&src[id..id + unit]);
                w += unit;
            }
        }
    }
}

fn convert_buf(
    kernels: &Kernels,
    dst_ty: WType,
    src_ty: WType,
    src: &[u8],
    ne: usize,
) -> Result<Vec<u8>> {
    if dst_ty == WType::F32 {
        // norm/bias tensors widen to f32
        let mut tmp = vec![0.0f32; ne];
        kernels.cvt_to_f32(src_ty, &mut tmp, src);
        Ok(tmp.iter().flat_map(|v| v.to_le_bytes()).collect())
    } else {
        let mut out = vec![0u8; dst_ty.byte_len(ne)];
        kernels.convert(dst_ty, src_ty, &mut out, src, ne)?;
        Ok(out)
    }
}

/// Validate, convert, permute and shard one tensor payload.
#[allow(clippy::too_many_arguments)]
fn load_tensor(
    r: &mut BufReader<File>,
    origin: u64,
    name: &str,
    ti: &TensorInfo,
    z: usize,
    wd: &mut WDat,
    optional: bool,
    permute_heads: usize,
    kernels: &Kernels,
) -> Result<()> {
    // optional tensor with no memory reserved (rope table with rope_theta set)
    if !wd.is_allocated() {
        if optional {
            return Ok(());
        }
        return Err(RtError::Model(format!("{name}: no memory allocated for tensor")));
    }

    let src_ty = dtype_of(&ti.dtype)?;
    let (wy, wx) = shape_of(name, ti)?;
    if wx != wd.wx || wy != wd.wy {
        return Err(RtError::Model(format!(
            "{name}: tensor shape [{wy}, {wx}], expected [{}, {}]",
            wd.wy, wd.wx
        )));
    }
    let ne = wy * wx;
    let sz_ld = src_ty.byte_len(ne) as u64;
    if sz_ld != ti.data_offsets[1].saturating_sub(ti.data_offsets[0]) {
        return Err(RtError::Model(format!("{name}: tensor binary size mismatch")));
    }

    r.seek(SeekFrom::Start(origin + ti.data_offsets[0]))?;

    let cvt = src_ty != wd.d_type;
    if !cvt && permute_heads == 0 {
        return wd.read_z(z, r);
    }

    let mut buf = vec![0u8; sz_ld as usize];
    r.read_exact(&mut buf)?;

    let converted;
    let cur: &[u8] = if cvt {
        converted = convert_buf(kernels, wd.d_type, src_ty, &buf, ne)?;
        &converted
    } else {
        &buf
    };

    if permute_heads > 0 {
        // bias rows permute element-wise, weights permute whole rows
        let (unit, count) = if wd.wy == 1 {
            (wd.d_type.byte_len(1), wd.wx)
        } else {
            (wd.row_bytes(), wd.wy)
        };
        let mut out = vec![0u8; cur.len()];
        inv_permute_qk(&mut out, cur, unit, count, permute_heads);
        wd.copy_z(z, &out);
    } else {
        wd.copy_z(z, cur);
    }
    Ok(())
}

fn load_file_st(tr: &mut Transformer, path: &Path, kernels: &Kernels) -> Result<()> {
    info!("load: {}", path.display());
    let f = File::open(path)?;
    let mut r = BufReader::new(f);

    let mut len8 = [0u8; 8];
    r.read_exact(&mut len8)?;
    let header_len = u64::from_le_bytes(len8);
    if header_len == 0 || header_len > MAX_HEADER {
        return Err(RtError::Model(format!(
            "{}: invalid header size {header_len}",
            path.display()
        )));
    }
    let mut header = vec![0u8; header_len as usize];
    r.read_exact(&mut header)?;
    let origin = 8 + header_len;

    let header: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(&header)
        .map_err(|e| RtError::Model(format!("{}: header: {e}", path.display())))?;

    let n_heads = tr.conf.n_heads;
    let n_kv_heads = tr.conf.n_kv_heads;
    let n_experts = tr.conf.moe.map(|m| m.num_experts).unwrap_or(0);
    let w = &mut tr.weights;

    for (name, val) in &header {
        if name == "__metadata__" {
            continue;
        }
        let ti: TensorInfo = serde_json::from_value(val.clone())
            .map_err(|e| RtError::Model(format!("{name}: {e}")))?;

        macro_rules! ld {
            ($wd:expr, $z:expr, $opt:expr, $tr:expr) => {
                load_tensor(&mut r, origin, name, &ti, $z, $wd, $opt, $tr, kernels)?
            };
        }

        if let Some(rest) = name.strip_prefix("model.layers.") {
            let (l_str, rest) = rest
                .split_once('.')
                .ok_or_else(|| RtError::Model(format!("unexpected tensor name: {name}")))?;
            let layer: usize = l_str
                .parse()
                .map_err(|_| RtError::Model(format!("unexpected tensor name: {name}")))?;

            match rest {
                "input_layernorm.weight" => ld!(&mut w.rms_att, layer, false, 0),
                "self_attn.rotary_emb.inv_freq" => ld!(&mut w.rope_if, layer, true, 0),
                "self_attn.q_proj.weight" => ld!(&mut w.wq, layer, false, n_heads),
                "self_attn.k_proj.weight" => ld!(&mut w.wk, layer, false, n_kv_heads),
                "self_attn.v_proj.weight" => ld!(&mut w.wv, layer, false, 0),
                "self_attn.q_proj.bias" => ld!(&mut w.bq, layer, false, n_heads),
                "self_attn.k_proj.bias" => ld!(&mut w.bk, layer, false, n_kv_heads),
                "self_attn.v_proj.bias" => ld!(&mut w.bv, layer, false, 0),
                "self_attn.o_proj.weight" => ld!(&mut w.wo, layer, false, 0),
                "post_attention_layernorm.weight" => ld!(&mut w.rms_ffn, layer, false, 0),
                "mlp.gate_proj.weight" if n_experts == 0 => ld!(&mut w.w1, layer, false, 0),
                "mlp.down_proj.weight" if n_experts == 0 => ld!(&mut w.w2, layer, false, 0),
                "mlp.up_proj.weight" if n_experts == 0 => ld!(&mut w.w3, layer, false, 0),
                "block_sparse_moe.gate.weight" if n_experts > 0 => {
                    ld!(&mut w.moe_gate, layer, false, 0)
                }
                other if n_experts > 0 && other.starts_with("block_sparse_moe.experts.") => {
                    let tail = &other["block_sparse_moe.experts.".len()..];
                    let (e_str, wname) = tail
                        .split_once('.')
                        .ok_or_else(|| RtError::Model(format!("unexpected tensor name: {name}")))?;
                    let exp_id: usize = e_str
                        .parse()
                        .map_err(|_| RtError::Model(format!("invalid expert id in {name}")))?;
                    if exp_id >= n_experts {
                        return Err(RtError::Model(format!("expert id out of range in {name}")));
                    }
                    let z = layer * n_experts + exp_id;
                    match wname {
                        "w1.weight" => ld!(&mut w.w1, z, false, 0),
                        "w2.weight" => ld!(&mut w.w2, z, false, 0),
                        "w3.weight" => ld!(&mut w.w3, z, false, 0),
                        _ => return Err(RtError::Model(format!("unexpected expert tensor: {name}"))),
                    }
                }
                other => warn!("layer {layer}: ignored tensor \"{other}\""),
            }
        } else {
            match name.as_str() {
                "model.embed_tokens.weight" => ld!(&mut w.token_emb, 0, false, 0),
                "lm_head.weight" => ld!(&mut w.wcls, 0, false, 0),
                "model.norm.weight" => ld!(&mut w.rms_final, 0, false, 0),
                other => warn!("ignored tensor \"{other}\""),
            }
        }
    }
    Ok(())
}

/// Verify every expected tensor arrived, resolve the optional ones.
fn check_load(tr: &mut Transformer) -> Result<()> {
    let p = &tr.conf;
    let w = &mut tr.weights;

    if p.moe.is_some() {
        w.moe_gate.assert_loaded("block_sparse_moe.gate")?;
    }
    w.token_emb.assert_loaded("embed_tokens")?;
    w.rms_att.assert_loaded("input_layernorm")?;
    w.wq.assert_loaded("q_proj")?;
    w.wk.assert_loaded("k_proj")?;
    w.wv.assert_loaded("v_proj")?;
    w.wo.assert_loaded("o_proj")?;
    w.rms_ffn.assert_loaded("post_attention_layernorm")?;
    w.w1.assert_loaded("w1/gate_proj")?;
    w.w2.assert_loaded("w2/down_proj")?;
    w.w3.assert_loaded("w3/up_proj")?;
    w.rms_final.assert_loaded("norm")?;

    if p.rope_theta == 0.0 {
        if w.rope_if.ne != 0 {
            w.rope_if.assert_loaded("rotary_emb.inv_freq")?;
        } else {
            return Err(RtError::Model(
                "rope_theta is undefined and rotary_emb.inv_freq was not found; \
                 set rope_set in the run config to run this model"
                    .into(),
            ));
        }
    }

    // classifier falls back to the token embedding (qwen2 checkpoints)
    if w.wcls.ne != 0 {
        w.wcls.assert_loaded("lm_head")?;
    } else {
        info!("classifier uses embed_tokens.weight");
        w.wcls = WDat::unallocated();
    }

    // the qkv bias triple appears together or not at all
    if w.bq.ne != 0 {
        w.bq.assert_loaded("q_proj.bias")?;
        w.bk.assert_loaded("k_proj.bias")?;
        w.bv.assert_loaded("v_proj.bias")?;
    } else {
        if w.bk.ne != 0 || w.bv.ne != 0 {
            return Err(RtError::Model("k/v bias present without q bias".into()));
        }
        w.bq = WDat::unallocated();
        w.bk = WDat::unallocated();
        w.bv = WDat::unallocated();
    }
    Ok(())
}

/// Load every safetensors file of the checkpoint into the transformer.
pub(crate) fn load_checkpoint_weights(
    tr: &mut Transformer,
    run: &RunConfig,
    kernels: &Kernels,
) -> Result<()> {
    let n_files = run.load.model_num_safetensors.max(1);
    for i in 1..=n_files {
        let file_name = if n_files == 1 {
            "model.safetensors".to_string()
        } else {
            format!("model-{i:05}-of-{n_files:05}.safetensors")
        };
        let path = Path::new(&run.load.model_path).join(file_name);
        load_file_st(tr, &path, kernels)?;
    }
    check_load(tr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inv_permute_round_trip() {
        // forward permutation of 8 rows with 2 heads, then the inverse
        let n_heads = 2;
        let count = 8;
        let unit = 4;
        let src: Vec<u8> = (0..count * unit).map(|i| i as u8).collect();

        // apply the forward reshape(n_heads, count/n_heads/2, 2).transpose(1, 2)
        let na = n_heads;
        let nb = count / n_heads / 2;
        let nc = 2;
        let mut permuted = vec![0u8; src.len()];
        let mut wr = 0;
        for a in 0..na {
            for c in 0..nc {
                for b in 0..nb {
                    let id = ((a * nb + b) * nc + c) * unit;
                    // forward: out[(a, c, b)] = in[(a, b, c)]
                    permuted[wr..wr + unit].copy_from_slice(&src[id..id + unit]);
                    wr += unit;
                }
            }
        }

        let mut back = vec![0u8; src.len()];
        inv_permute_qk(&mut back, &permuted, unit, count, n_heads);
        assert_eq!(back, src);
    }

    #[test]
    fn test_shape_of() {
        let ti = TensorInfo {
            dtype: "F32".into(),
            shape: vec![4096],
            data_offsets: [0, 0],
        };
        assert_eq!(shape_of("t", &ti).unwrap(), (1, 4096));
        let ti2 = TensorInfo {
            dtype: "F32".into(),
            shape: vec![32000, 4096],
            data_offsets: [0, 0],
        };
        assert_eq!(shape_of("t", &ti2).unwrap(), (32000, 4096));
    }

    #[test]
    fn test_dtype_of() {
        assert_eq!(dtype_of("F16").unwrap(), WType::F16);
        assert_eq!(dtype_of("BF16").unwrap(), WType::Bf16);
        assert!(dtype_of("I8").is_err());
    }
}
