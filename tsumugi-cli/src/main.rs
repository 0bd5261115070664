mod chat;
mod display;
mod generate;

use clap::Parser;
use tsumugi_engine::{Engine, RunMode};

/// Single-process CPU runtime for LLaMA-family transformer checkpoints.
#[derive(Parser, Debug)]
#[command(name = "tsumugi")]
#[command(about = "CPU inference runtime for LLaMA-family models", long_about = None)]
struct Args {
    /// Run configuration JSON file
    run_config: String,

    /// Enable verbose logging (debug level)
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new(if args.verbose { "debug" } else { "info" })
        });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run(&args) {
        eprintln!("error: {e:#}");
        std::process::exit(-1);
    }
}

fn run(args: &Args) -> anyhow::Result<()> {
    let mut engine = Engine::build(&args.run_config)?;
    match engine.conf.mode()? {
        RunMode::Generate => generate::run(&mut engine),
        RunMode::Chat => chat::run(&mut engine),
    }
}
