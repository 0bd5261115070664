//! Engine assembly.
//!
//! Owns the whole pipeline: run config, kernel set, worker pool, tokenizer,
//! transformer and sampler. An `Engine` is a plain owned value; several can
//! coexist in one process, each with its own pool and state.

use crate::config::{ModelFamily, RunConfig};
use crate::error::Result;
use crate::kernels::Kernels;
use crate::model::{CTok, ExecCtx, Transformer, load_model_config, resolve_wd_types};
use crate::model::load_checkpoint_weights;
use crate::numa::{ThreadMap, Topology, WorkerPool};
use crate::sampler::{ProbIndex, Sampler};
use crate::tokenizer::Tokenizer;
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use tracing::info;

pub struct Engine {
    pub conf: RunConfig,
    family: ModelFamily,
    kernels: Kernels,
    map: ThreadMap,
    pool: WorkerPool,
    tokenizer: Tokenizer,
    transformer: Transformer,
    sampler: Sampler,
    token_eos: u32,
    token_eot: u32,
}

impl Engine {
    /// Build the full pipeline from a run-config JSON file.
    pub fn build(conf_path: impl AsRef<Path>) -> Result<Engine> {
        let conf = RunConfig::load(conf_path)?;
        Self::build_from_config(conf)
    }

    pub fn build_from_config(conf: RunConfig) -> Result<Engine> {
        let family = conf.family()?;
        let mode = conf.mode()?;

        let kernels = Kernels::init(conf.simd_mode)?;

        let tok_path = if conf.load.tokenizer_name.is_empty() {
            Path::new(&conf.load.model_path).join("tokenizer.json")
        } else {
            PathBuf::from(&conf.load.tokenizer_name)
        };
        info!("load tokenizer: {}", tok_path.display());
        let tokenizer = Tokenizer::load(&tok_path, family)?;

        let token_eos = tokenizer.find_special(&conf.token_eos_str)?;
        let token_eot = tokenizer.find_special(&conf.token_eot_str)?;

        info!("load transformer..");
        let mut tconf = load_model_config(&conf)?;
        resolve_wd_types(&mut tconf, &conf, &kernels)?;

        let topo = Topology::detect();
        let map = ThreadMap::new(&topo, conf.num_procs, conf.numa_nodes);
        let pool = WorkerPool::spawn(&map);

        let mut transformer = Transformer::build(tconf, &map, mode, conf.kv_compact)?;
        load_checkpoint_weights(&mut transformer, &conf, &kernels)?;
        transformer.set_token_eot(token_eot);

        if tokenizer.vocab_size() != transformer.conf.vocab_size {
            // qwen2.5 checkpoints round vocab_size up past the tokenizer
            info!(
                "tokenizer/transformer vocab_size mismatch ({}/{})",
                tokenizer.vocab_size(),
                transformer.conf.vocab_size
            );
        }

        let sampler = Sampler::build(
            &conf.sampler,
            conf.test_nan_logits,
            &tokenizer,
            transformer.conf.vocab_size,
        )?;

        Ok(Engine {
            family,
            kernels,
            map,
            pool,
            tokenizer,
            transformer,
            sampler,
            token_eos,
            token_eot,
            conf,
        })
    }

    pub fn family(&self) -> ModelFamily {
        self.family
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn token_eos(&self) -> u32 {
        self.token_eos
    }

    pub fn token_eot(&self) -> u32 {
        self.token_eot
    }

    pub fn seq_len(&self) -> usize {
        self.transformer.conf.seq_len
    }

    /// Generation step limit; zero in the config means the context size.
    pub fn gen_run_steps(&self) -> usize {
        if self.conf.gen_run_steps <= 0 {
            self.transformer.conf.seq_len
        } else {
            self.conf.gen_run_steps as usize
        }
    }

    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        self.tokenizer.encode(text)
    }

    pub fn decode(&self, token: u32) -> Cow<'_, str> {
        self.tokenizer.decode(token)
    }

    /// Advance the KV cache by one token; logits are produced only when
    /// `want_logits` is set.
    pub fn forward(&mut self, token: u32, is_sampled: bool, want_logits: bool) {
        let ctx = ExecCtx {
            kernels: &self.kernels,
            pool: &self.pool,
            nt_mp: self.map.nt_mp,
        };
        self.transformer.forward(&ctx, token, is_sampled, want_logits);
    }

    /// Forward a token run, producing logits on the last one if requested.
    pub fn forward_tokens(&mut self, tokens: &[u32], logits_on_last: bool) {
        let last = tokens.len().saturating_sub(1);
        for (i, &t) in tokens.iter().enumerate() {
            self.forward(t, false, logits_on_last && i == last);
        }
    }

    /// Sample the next token from the current logits.
    pub fn sample(&mut self) -> ProbIndex {
        let s = &mut self.transformer.state;
        self.sampler.sample(
            &mut s.logits,
            &s.tokens[..s.n_tokens],
            s.n_tokens_samp,
            self.token_eos,
            self.token_eot,
            &self.tokenizer,
        )
    }

    /// Ensure room for `n` more tokens, compacting the cache if configured.
    /// Returns the number of evicted tokens.
    pub fn reserve_kv(&mut self, n: usize) -> usize {
        if self.conf.kv_compact {
            self.transformer.reserve_kv(n)
        } else {
            0
        }
    }

    /// Reset the dialog, optionally keeping the pinned system prompt.
    pub fn reset(&mut self, keep_sys: bool) {
        let n = if keep_sys { self.transformer.n_tokens_sys() } else { 0 };
        self.transformer.rewind(n);
        if !keep_sys {
            self.transformer.mark_sys_prompt();
        }
    }

    /// Pin the current cache contents as the system prompt.
    pub fn mark_sys_prompt(&mut self) {
        self.transformer.mark_sys_prompt();
    }

    /// Rewind the token cache (dialog regen/forget).
    pub fn rewind(&mut self, n: usize) {
        self.transformer.rewind(n);
    }

    pub fn n_tokens(&self) -> usize {
        self.transformer.n_tokens()
    }

    pub fn n_tokens_del(&self) -> usize {
        self.transformer.n_tokens_del()
    }

    pub fn tokens(&self) -> &[CTok] {
        self.transformer.tokens()
    }

    pub fn logits(&self) -> &[f32] {
        self.transformer.logits()
    }

    /// Re-run the forward pass for the token at `pos` (dialog regeneration:
    /// rewind first, then recompute its logits).
    pub fn regen_at(&mut self, pos: usize) {
        if pos >= self.transformer.n_tokens() {
            return;
        }
        let token = self.transformer.tokens()[pos].token_id;
        self.transformer.rewind(pos);
        let ctx = ExecCtx {
            kernels: &self.kernels,
            pool: &self.pool,
            nt_mp: self.map.nt_mp,
        };
        self.transformer.forward(&ctx, token, false, true);
    }
}
