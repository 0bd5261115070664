//! Free-running generation from a configured prompt.

use crate::display::TokenPrinter;
use anyhow::Result;
use std::time::Instant;
use tracing::info;
use tsumugi_engine::Engine;

pub fn run(engine: &mut Engine) -> Result<()> {
    let steps = engine.gen_run_steps();
    info!("generate: max {steps} tokens");

    let t0 = Instant::now();
    let mut printer = TokenPrinter::new(engine);

    let prompt = engine.conf.gen_mode_prompt.clone();
    if prompt.is_empty() {
        anyhow::bail!("generate mode needs a gen_mode_prompt in the run config");
    }
    let ids = engine.encode(&prompt)?;
    let last = ids.len() - 1;
    for (i, &id) in ids.iter().enumerate() {
        engine.forward(id, false, i == last);
        printer.print(engine, id, None);
    }

    for _ in 0..steps {
        let pi = engine.sample();
        if pi.index == engine.token_eos() || pi.index == engine.token_eot() {
            break;
        }
        printer.print(engine, pi.index, Some(pi.prob));
        engine.forward(pi.index, true, true);
    }

    let dt = t0.elapsed().as_secs_f64();
    let n = engine.n_tokens();
    println!();
    println!("total time: {dt:.2}s for {n} tokens, tok/s: {:.2}", n as f64 / dt.max(1e-9));
    Ok(())
}
