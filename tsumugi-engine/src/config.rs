//! Run configuration
//!
//! One JSON file selects the model family, checkpoint location, numeric and
//! hardware options, sampler parameters and the chat/generate run mode.

use crate::error::{Result, RtError};
use serde::Deserialize;
use std::path::Path;

/// Supported model families. The family selects prompt templates and
/// tokenizer quirks (marker normalisation, byte fallback).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    TinyLlama,
    Llama1,
    Llama2,
    CodeLlama,
    Llama3,
    Llama31,
    Mistral,
    Mathstral,
    Zephyr,
    Mixtral,
    Vigogne2,
    Qwen2,
}

impl ModelFamily {
    pub fn from_ident(s: &str) -> Option<ModelFamily> {
        Some(match s {
            "tinyllama" => ModelFamily::TinyLlama,
            "llama1" => ModelFamily::Llama1,
            "llama2" => ModelFamily::Llama2,
            "codellama" => ModelFamily::CodeLlama,
            "llama3" => ModelFamily::Llama3,
            "llama31" => ModelFamily::Llama31,
            "mistral" => ModelFamily::Mistral,
            "mathstral" => ModelFamily::Mathstral,
            "zephyr" => ModelFamily::Zephyr,
            "mixtral" => ModelFamily::Mixtral,
            "vigogne2" => ModelFamily::Vigogne2,
            "qwen2" => ModelFamily::Qwen2,
            _ => return None,
        })
    }

    /// LLaMA-3-style tokenizer: 0xC4A0/0xC48A pseudo-whitespace codes, no
    /// byte-fallback token block, no leading-space strip after BOS.
    pub fn is_ll3_style(self) -> bool {
        matches!(self, ModelFamily::Llama3 | ModelFamily::Llama31 | ModelFamily::Qwen2)
    }

    /// Built-in chat templates (prompt mode 0). `{}` marks the prompt slot.
    pub fn chat_templates(self) -> Option<ChatTemplates> {
        let t = match self {
            ModelFamily::TinyLlama | ModelFamily::Zephyr => ChatTemplates {
                sys: "<|system|>\n{}</s>\n",
                user_first: "",
                user: "<|user|>\n{}</s>\n<|assistant|>\n",
                end: "</s>\n",
            },
            ModelFamily::Llama2 | ModelFamily::CodeLlama => ChatTemplates {
                sys: "<s>[INST] <<SYS>>\n{}\n<</SYS>>\n\n",
                user_first: "{} [/INST] ",
                user: "<s>[INST] {} [/INST] ",
                end: "</s>",
            },
            ModelFamily::Llama3 | ModelFamily::Llama31 => ChatTemplates {
                sys: "<|begin_of_text|><|start_header_id|>system<|end_header_id|>\n\n{}<|eot_id|>",
                user_first: "",
                user: "<|start_header_id|>user<|end_header_id|>\n\n{}<|eot_id|><|start_header_id|>assistant<|end_header_id|>\n\n",
                end: "<|eot_id|>\n",
            },
            ModelFamily::Mistral | ModelFamily::Mathstral => ChatTemplates {
                sys: "",
                user_first: "",
                user: "<s>[INST] {} [/INST]",
                end: "</s>\n",
            },
            ModelFamily::Mixtral => ChatTemplates {
                sys: "",
                user_first: "<s> [INST] {} [/INST]",
                user: "[INST] {} [/INST] ",
                end: "</s>",
            },
            ModelFamily::Vigogne2 => ChatTemplates {
                sys: "<s>[INST] <<SYS>>\n{}\n<</SYS>>\n\n",
                user_first: "{} [/INST] ",
                user: "[INST] {} [/INST]",
                end: "</s>\n",
            },
            ModelFamily::Qwen2 => ChatTemplates {
                sys: "<|im_start|>system\n{}<|im_end|>\n",
                user_first: "",
                user: "<|im_start|>user\n{}<|im_end|>\n<|im_start|>assistant\n",
                end: "<|im_end|>\n",
            },
            ModelFamily::Llama1 => return None,
        };
        Some(t)
    }
}

/// Chat prompt templates for one model family. Empty strings mean the slot
/// is unused.
#[derive(Debug, Clone)]
pub struct ChatTemplates {
    pub sys: &'static str,
    pub user_first: &'static str,
    pub user: &'static str,
    pub end: &'static str,
}

/// Substitute the prompt into a `{}` template.
pub fn apply_template(template: &str, prompt: &str) -> String {
    template.replacen("{}", prompt, 1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Generate,
    Chat,
}

/// Sampler parameters, read from the top level of the run config.
#[derive(Debug, Clone, Deserialize)]
pub struct SamplerConf {
    #[serde(default = "d_temperature")]
    pub temperature: f32,
    #[serde(default = "d_topp")]
    pub topp: f32,
    #[serde(default)]
    pub topk: u32,
    #[serde(default)]
    pub topp_minp: f32,
    #[serde(default)]
    pub topp_eos: bool,
    #[serde(default)]
    pub repeat_penalty: f32,
    #[serde(default)]
    pub repeat_penalty_n: u32,
    #[serde(default)]
    pub eos_amp: f32,
    #[serde(default)]
    pub eos_amp_n: u32,
    #[serde(default)]
    pub rand_seed: u64,
    /// UTF-8 allow-list: multi-byte characters outside it are masked out of
    /// sampling (ASCII always passes).
    #[serde(default)]
    pub ch_restrict: Option<String>,
}

impl Default for SamplerConf {
    fn default() -> Self {
        SamplerConf {
            temperature: d_temperature(),
            topp: d_topp(),
            topk: 0,
            topp_minp: 0.0,
            topp_eos: false,
            repeat_penalty: 0.0,
            repeat_penalty_n: 0,
            eos_amp: 0.0,
            eos_amp_n: 0,
            rand_seed: 0,
            ch_restrict: None,
        }
    }
}

fn d_temperature() -> f32 {
    1.0
}
fn d_topp() -> f32 {
    0.5
}
fn d_one() -> u32 {
    1
}
fn d_true() -> bool {
    true
}
fn d_auto() -> i32 {
    -1
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoadConfig {
    pub model_path: String,
    /// Empty selects `<model_path>/tokenizer.json`.
    #[serde(default)]
    pub tokenizer_name: String,
    #[serde(default = "d_one")]
    pub model_num_safetensors: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatConfig {
    #[serde(default)]
    pub chat_use_colors: bool,
    /// 0 hides forwarded tokens, 1 echoes them.
    #[serde(default)]
    pub fwd_disp_mode: u32,
    #[serde(default)]
    pub chat_prompt_mode: u32,
    #[serde(default)]
    pub chat_assistant_name: String,
    #[serde(default)]
    pub chat_user_name: String,

    // mode 0: family built-ins plus these prompts
    #[serde(default)]
    pub cm0_sys_prompt: String,
    #[serde(default)]
    pub cm0_user_prompt: String,

    // mode 1: fully user supplied templates
    #[serde(default)]
    pub cm1_sys_template: String,
    #[serde(default)]
    pub cm1_user_first_template: String,
    #[serde(default)]
    pub cm1_user_template: String,
    #[serde(default)]
    pub cm1_end_template: String,
    #[serde(default)]
    pub cm1_sys_prompt: String,
    #[serde(default)]
    pub cm1_user_prompt: String,

    // mode 2: name-switch driven dialog
    #[serde(default)]
    pub cm2_sys_template: String,
    #[serde(default)]
    pub cm2_user_template: String,
    #[serde(default)]
    pub cm2_user_name_sw: String,
    #[serde(default)]
    pub cm2_sys_prompt: String,
    #[serde(default)]
    pub cm2_user_prompt: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    pub model_ident: String,
    pub load: LoadConfig,

    /// Override of rope_theta; 0 keeps the checkpoint value.
    #[serde(default)]
    pub rope_set: f32,
    /// -1 auto, 0 FPU, 1 SSE, 2 AVX, 3 AVX2.
    #[serde(default = "d_auto")]
    pub simd_mode: i32,
    #[serde(default)]
    pub num_procs: i32,
    #[serde(default)]
    pub numa_nodes: i32,

    #[serde(default)]
    pub cvt_sf16: bool,
    #[serde(default)]
    pub cvt_f12: bool,
    #[serde(default)]
    pub cvt_f8: bool,

    #[serde(default = "d_true")]
    pub test_nan_logits: bool,
    /// Evict old dialog turns when the context fills; when false a full
    /// context answers end-of-text until reset.
    #[serde(default = "d_true")]
    pub kv_compact: bool,

    #[serde(flatten)]
    pub sampler: SamplerConf,

    /// 0 generate, 1 chat.
    #[serde(default)]
    pub run_mode: u32,
    #[serde(default)]
    pub gen_run_steps: i32,
    pub token_eos_str: String,
    pub token_eot_str: String,

    #[serde(default)]
    pub tok_disp_raw: bool,
    #[serde(default)]
    pub tok_disp_split: bool,
    #[serde(default)]
    pub tok_disp_prob: bool,

    #[serde(default)]
    pub gen_mode_prompt: String,
    #[serde(default)]
    pub chat: ChatConfig,
}

impl RunConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<RunConfig> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let conf: RunConfig = serde_json::from_str(&text)
            .map_err(|e| RtError::Config(format!("{}: {e}", path.as_ref().display())))?;
        conf.validate()?;
        Ok(conf)
    }

    pub fn family(&self) -> Result<ModelFamily> {
        ModelFamily::from_ident(&self.model_ident)
            .ok_or_else(|| RtError::Config(format!("undefined model_ident: {}", self.model_ident)))
    }

    pub fn mode(&self) -> Result<RunMode> {
        match self.run_mode {
            0 => Ok(RunMode::Generate),
            1 => Ok(RunMode::Chat),
            m => Err(RtError::Config(format!("undefined run_mode: {m}"))),
        }
    }

    fn validate(&self) -> Result<()> {
        self.family()?;
        let mode = self.mode()?;
        if !(-1..=3).contains(&self.simd_mode) {
            return Err(RtError::Config(format!("simd_mode out of range: {}", self.simd_mode)));
        }
        if mode == RunMode::Chat && self.chat.chat_prompt_mode > 2 {
            return Err(RtError::Config(format!(
                "chat_prompt_mode = {} is undefined",
                self.chat.chat_prompt_mode
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json() -> serde_json::Value {
        serde_json::json!({
            "model_ident": "llama2",
            "load": { "model_path": "/models/llama2-7b" },
            "token_eos_str": "</s>",
            "token_eot_str": "</s>"
        })
    }

    #[test]
    fn test_minimal_config_defaults() {
        let conf: RunConfig = serde_json::from_value(minimal_json()).unwrap();
        conf.validate().unwrap();
        assert_eq!(conf.family().unwrap(), ModelFamily::Llama2);
        assert_eq!(conf.mode().unwrap(), RunMode::Generate);
        assert_eq!(conf.simd_mode, -1);
        assert!(conf.kv_compact);
        assert_eq!(conf.sampler.temperature, 1.0);
        assert_eq!(conf.load.model_num_safetensors, 1);
    }

    #[test]
    fn test_sampler_keys_at_top_level() {
        let mut v = minimal_json();
        v["temperature"] = serde_json::json!(0.7);
        v["topk"] = serde_json::json!(40);
        let conf: RunConfig = serde_json::from_value(v).unwrap();
        assert_eq!(conf.sampler.temperature, 0.7);
        assert_eq!(conf.sampler.topk, 40);
    }

    #[test]
    fn test_unknown_family_rejected() {
        let mut v = minimal_json();
        v["model_ident"] = serde_json::json!("gpt2");
        let conf: RunConfig = serde_json::from_value(v).unwrap();
        assert!(matches!(conf.validate(), Err(RtError::Config(_))));
    }

    #[test]
    fn test_bad_run_mode_rejected() {
        let mut v = minimal_json();
        v["run_mode"] = serde_json::json!(7);
        let conf: RunConfig = serde_json::from_value(v).unwrap();
        assert!(matches!(conf.validate(), Err(RtError::Config(_))));
    }

    #[test]
    fn test_ll3_style_families() {
        assert!(ModelFamily::Llama3.is_ll3_style());
        assert!(ModelFamily::Qwen2.is_ll3_style());
        assert!(!ModelFamily::Llama2.is_ll3_style());
        assert!(!ModelFamily::Mistral.is_ll3_style());
    }

    #[test]
    fn test_apply_template() {
        let t = ModelFamily::Llama2.chat_templates().unwrap();
        let s = apply_template(t.user, "hi");
        assert_eq!(s, "<s>[INST] hi [/INST] ");
    }
}
