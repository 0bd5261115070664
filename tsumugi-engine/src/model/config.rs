//! Transformer configuration from the checkpoint's config.json.

use crate::config::{ModelFamily, RunConfig};
use crate::error::{Result, RtError};
use crate::kernels::{Kernels, WType};
use serde::Deserialize;
use std::path::Path;
use tracing::info;

/// Sparse mixture-of-experts routing parameters.
#[derive(Debug, Clone, Copy)]
pub struct MoeConf {
    pub num_experts: usize,
    pub top_k: usize,
}

/// Immutable transformer hyperparameters plus the resolved storage dtypes.
#[derive(Debug, Clone)]
pub struct TConf {
    pub dim: usize,
    pub hidden_dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub seq_len: usize,
    pub rms_norm_eps: f32,
    /// 0.0 means the checkpoint carries per-layer inverse-frequency tables.
    pub rope_theta: f32,
    pub vocab_size: usize,

    /// Checkpoint storage dtype.
    pub torch_type: WType,

    // derived
    pub head_size: usize,
    pub kv_dim: usize,
    pub kv_mul: usize,
    pub sqrt_head_size: f32,

    /// Memory dtype of the embedding/classifier weights.
    pub em_type: WType,
    /// Memory dtype of the per-layer weights.
    pub lw_type: WType,
    /// Effective on-load conversion switches after CPU capability checks.
    pub cvt_sf16: bool,
    pub cvt_f12: bool,
    pub cvt_f8: bool,

    pub moe: Option<MoeConf>,
}

#[derive(Deserialize)]
struct HfConfig {
    architectures: Vec<String>,
    model_type: String,
    hidden_act: String,
    hidden_size: usize,
    intermediate_size: usize,
    num_hidden_layers: usize,
    num_attention_heads: usize,
    num_key_value_heads: Option<usize>,
    max_position_embeddings: usize,
    rms_norm_eps: f32,
    rope_theta: Option<f32>,
    vocab_size: usize,
    torch_dtype: String,
    num_local_experts: Option<usize>,
    num_experts_per_tok: Option<usize>,
}

fn expect_arch(hf: &HfConfig, arch: &str, model_type: &str) -> Result<()> {
    if !hf.architectures.iter().any(|a| a == arch) || hf.model_type != model_type {
        return Err(RtError::Model(format!(
            "checkpoint architecture {:?}/{} does not match the configured family (expected {arch}/{model_type})",
            hf.architectures, hf.model_type
        )));
    }
    Ok(())
}

/// Read `<model_path>/config.json` and derive the transformer config.
pub(crate) fn load_model_config(run: &RunConfig) -> Result<TConf> {
    let family = run.family()?;
    let path = Path::new(&run.load.model_path).join("config.json");
    info!("read model config: {}", path.display());

    let text = std::fs::read_to_string(&path)?;
    let hf: HfConfig = serde_json::from_str(&text)
        .map_err(|e| RtError::Model(format!("{}: {e}", path.display())))?;

    let mut moe = None;
    match family {
        ModelFamily::Mistral | ModelFamily::Mathstral | ModelFamily::Zephyr => {
            expect_arch(&hf, "MistralForCausalLM", "mistral")?;
        }
        ModelFamily::Mixtral => {
            expect_arch(&hf, "MixtralForCausalLM", "mixtral")?;
            let num_experts = hf
                .num_local_experts
                .ok_or_else(|| RtError::Model("mixtral config lacks num_local_experts".into()))?;
            let top_k = hf
                .num_experts_per_tok
                .ok_or_else(|| RtError::Model("mixtral config lacks num_experts_per_tok".into()))?;
            if top_k == 0 || top_k > num_experts {
                return Err(RtError::Model(format!(
                    "invalid expert routing: top_k {top_k} of {num_experts} experts"
                )));
            }
            moe = Some(MoeConf { num_experts, top_k });
        }
        ModelFamily::Qwen2 => expect_arch(&hf, "Qwen2ForCausalLM", "qwen2")?,
        _ => expect_arch(&hf, "LlamaForCausalLM", "llama")?,
    }

    if hf.hidden_act != "silu" {
        return Err(RtError::Model(format!("unsupported hidden_act: {}", hf.hidden_act)));
    }

    let torch_type = match hf.torch_dtype.as_str() {
        "float16" => WType::F16,
        "bfloat16" => WType::Bf16,
        "float32" => WType::F32,
        d => return Err(RtError::Model(format!("unsupported torch_dtype: {d}"))),
    };

    let n_heads = hf.num_attention_heads;
    let n_kv_heads = hf.num_key_value_heads.unwrap_or_else(|| {
        info!("num_key_value_heads undefined, assumed = num_attention_heads ({n_heads})");
        n_heads
    });
    let dim = hf.hidden_size;

    if n_heads == 0 || dim % n_heads != 0 {
        return Err(RtError::Model(format!(
            "hidden_size {dim} is not a multiple of num_attention_heads {n_heads}"
        )));
    }
    if n_kv_heads == 0 || n_heads % n_kv_heads != 0 {
        return Err(RtError::Model(format!(
            "num_attention_heads {n_heads} is not a multiple of num_key_value_heads {n_kv_heads}"
        )));
    }
    let head_size = dim / n_heads;
    if head_size % 2 != 0 {
        return Err(RtError::Model(format!(
            "head size {head_size} is odd, rotary encoding pairs two lanes"
        )));
    }

    let mut rope_theta = hf.rope_theta.unwrap_or(0.0);
    if hf.rope_theta.is_none() {
        info!("rope_theta undefined, expecting rotary_emb.inv_freq in the checkpoint");
    }
    if run.rope_set != 0.0 {
        if rope_theta != 0.0 && run.rope_set != rope_theta {
            info!("rope_theta changed from {rope_theta} to {}", run.rope_set);
        } else {
            info!("rope_theta set to {}", run.rope_set);
        }
        rope_theta = run.rope_set;
    }

    info!("torch float type: {}", torch_type.name());

    Ok(TConf {
        dim,
        hidden_dim: hf.intermediate_size,
        n_layers: hf.num_hidden_layers,
        n_heads,
        n_kv_heads,
        seq_len: hf.max_position_embeddings,
        rms_norm_eps: hf.rms_norm_eps,
        rope_theta,
        vocab_size: hf.vocab_size,
        torch_type,
        head_size,
        kv_dim: (dim * n_kv_heads) / n_heads,
        kv_mul: n_heads / n_kv_heads,
        sqrt_head_size: (head_size as f32).sqrt(),
        em_type: torch_type,
        lw_type: torch_type,
        cvt_sf16: false,
        cvt_f12: false,
        cvt_f8: false,
        moe,
    })
}

/// Resolve the memory dtypes from the conversion switches and CPU support.
pub(crate) fn resolve_wd_types(conf: &mut TConf, run: &RunConfig, kernels: &Kernels) -> Result<()> {
    conf.em_type = conf.torch_type;
    conf.lw_type = conf.torch_type;
    conf.cvt_sf16 = run.cvt_sf16;
    conf.cvt_f12 = run.cvt_f12;
    conf.cvt_f8 = run.cvt_f8;

    if !matches!(conf.torch_type, WType::F32 | WType::F16 | WType::Bf16) {
        return Err(RtError::Model(format!(
            "unsupported model torch type {}",
            conf.torch_type.name()
        )));
    }

    // no F16C: f16 checkpoints go through the exactly-invertible sf16 form
    if !kernels.cpu_f16c && conf.torch_type == WType::F16 && !conf.cvt_sf16 {
        info!("model is float16 but CPU has no F16C support, sf16 conversion in use");
        conf.cvt_sf16 = true;
    }

    if conf.cvt_sf16 {
        if conf.torch_type != WType::F16 {
            return Err(RtError::Model(
                "model conversion to sf16 requires a float16 checkpoint".into(),
            ));
        }
        conf.em_type = WType::Sf16;
        conf.lw_type = WType::Sf16;
        info!("model weights converted to sf16");
    }

    // can combine with cvt_sf16: embeddings stay sf16, layer weights shrink
    if conf.cvt_f8 {
        if conf.torch_type == WType::F32 {
            return Err(RtError::Model("model conversion to f8 requires a 16-bit checkpoint".into()));
        }
        conf.lw_type = WType::F8;
        info!("layer weights converted to float8");
    } else if conf.cvt_f12 {
        if conf.torch_type == WType::F32 {
            return Err(RtError::Model("model conversion to f12 requires a 16-bit checkpoint".into()));
        }
        conf.lw_type = WType::F12;
        info!("layer weights converted to float12");
    }

    Ok(())
}
