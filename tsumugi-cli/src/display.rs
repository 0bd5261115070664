//! Console token display.

use std::io::{IsTerminal, Write};
use tsumugi_engine::Engine;

pub const COL_SYS: &str = "\x1b[0;90m";
pub const COL_USER: &str = "\x1b[0;36m";
pub const COL_LLM: &str = "\x1b[0;37m";
pub const COL_RESET: &str = "\x1b[0m";

/// True when ANSI colors should be emitted.
pub fn use_colors(engine: &Engine) -> bool {
    engine.conf.chat.chat_use_colors && std::io::stdout().is_terminal()
}

pub fn color(enabled: bool, code: &str) {
    if enabled {
        print!("{code}");
        let _ = std::io::stdout().flush();
    }
}

/// Streams decoded tokens to stdout, honouring the display options and the
/// sentence-piece rule that one leading space after BOS is swallowed.
pub struct TokenPrinter {
    raw: bool,
    split: bool,
    show_prob: bool,
    sentencepiece: bool,
    bos: u32,
    prev: u32,
}

impl TokenPrinter {
    pub fn new(engine: &Engine) -> TokenPrinter {
        let t = engine.tokenizer();
        TokenPrinter {
            raw: engine.conf.tok_disp_raw,
            split: engine.conf.tok_disp_split,
            show_prob: engine.conf.tok_disp_prob,
            sentencepiece: t.sentencepiece(),
            bos: t.bos_token(),
            prev: u32::MAX,
        }
    }

    pub fn print(&mut self, engine: &Engine, token: u32, prob: Option<f32>) {
        if self.raw {
            let s = engine.tokenizer().token_str(token);
            print!("{s}");
            if s == "<0x0A>" {
                println!();
            }
        } else {
            let piece = engine.decode(token);
            let mut s: &str = &piece;
            if self.sentencepiece && self.prev == self.bos {
                s = s.strip_prefix(' ').unwrap_or(s);
            }
            self.prev = token;
            print!("{s}");
        }
        match prob {
            Some(p) if self.show_prob => print!("[{p:.2}],"),
            _ if self.show_prob || self.split => print!(","),
            _ => {}
        }
        let _ = std::io::stdout().flush();
    }
}
