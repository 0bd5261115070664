//! Interactive console chat.
//!
//! Line oriented: prompts are read from stdin, formatted with the model
//! family's chat template (or user-supplied templates for prompt modes 1
//! and 2) and forwarded; replies stream until an end token. Slash commands
//! replace the original menu: /regen /forget /reset /reset-sys /quit.

use crate::display::{self, TokenPrinter};
use anyhow::{Result, bail};
use std::io::{BufRead, Write};
use tracing::info;
use tsumugi_engine::{Engine, apply_template};

/// Tokens reserved in the KV cache before each reply.
const REPLY_RESERVE: usize = 500;

struct Templates {
    sys: String,
    user_first: String,
    user: String,
    end: String,
    sys_prompt: String,
    user_prompt: String,
    /// Prompt mode 2: reply ends when the model emits this name switch.
    name_switch: Option<String>,
}

fn resolve_templates(engine: &Engine) -> Result<Templates> {
    let chat = &engine.conf.chat;
    match chat.chat_prompt_mode {
        0 => {
            let t = match engine.family().chat_templates() {
                Some(t) => t,
                None => bail!(
                    "chat_prompt_mode 0 has no built-in templates for model '{}'",
                    engine.conf.model_ident
                ),
            };
            Ok(Templates {
                sys: t.sys.to_string(),
                user_first: t.user_first.to_string(),
                user: t.user.to_string(),
                end: t.end.to_string(),
                sys_prompt: chat.cm0_sys_prompt.clone(),
                user_prompt: chat.cm0_user_prompt.clone(),
                name_switch: None,
            })
        }
        1 => Ok(Templates {
            sys: chat.cm1_sys_template.clone(),
            user_first: chat.cm1_user_first_template.clone(),
            user: chat.cm1_user_template.clone(),
            end: chat.cm1_end_template.clone(),
            sys_prompt: chat.cm1_sys_prompt.clone(),
            user_prompt: chat.cm1_user_prompt.clone(),
            name_switch: None,
        }),
        2 => {
            let sw = chat.cm2_user_name_sw.clone();
            if sw.len() < 5 || sw.len() > 64 {
                bail!("cm2_user_name_sw must hold 5 to 64 characters");
            }
            Ok(Templates {
                sys: chat.cm2_sys_template.clone(),
                user_first: String::new(),
                user: chat.cm2_user_template.clone(),
                end: sw.clone(),
                sys_prompt: chat.cm2_sys_prompt.clone(),
                user_prompt: chat.cm2_user_prompt.clone(),
                name_switch: Some(sw),
            })
        }
        m => bail!("invalid chat prompt mode {m}"),
    }
}

enum Input {
    Text(String),
    Regen,
    Forget,
    ResetKeep,
    ResetNew,
    Quit,
}

fn read_line() -> Input {
    let mut line = String::new();
    loop {
        line.clear();
        let _ = std::io::stdout().flush();
        match std::io::stdin().lock().read_line(&mut line) {
            Ok(0) | Err(_) => return Input::Quit,
            Ok(_) => {}
        }
        let text = line.trim_end_matches(['\r', '\n']);
        match text {
            "" => continue,
            "/quit" => return Input::Quit,
            "/regen" => return Input::Regen,
            "/forget" => return Input::Forget,
            "/reset" => return Input::ResetKeep,
            "/reset-sys" => return Input::ResetNew,
            t => return Input::Text(t.to_string()),
        }
    }
}

/// Rolling tail of the decoded reply, for mode 2 name-switch detection.
fn push_tail(tail: &mut String, piece: &str) {
    tail.push_str(piece);
    if tail.len() > 64 {
        let cut = tail.len() - 64;
        let mut idx = cut;
        while !tail.is_char_boundary(idx) {
            idx += 1;
        }
        tail.drain(..idx);
    }
}

pub fn run(engine: &mut Engine) -> Result<()> {
    let tpl = resolve_templates(engine)?;
    let colors = display::use_colors(engine);

    display::color(colors, display::COL_SYS);
    println!("------------------------------------");
    println!("chat mode {} started", engine.conf.chat.chat_prompt_mode);
    println!("commands: /regen /forget /reset /reset-sys /quit");

    let mut sys_prompt = tpl.sys_prompt.clone();
    let mut user_prompt = tpl.user_prompt.clone();
    let mut def_sys = !tpl.sys.is_empty();
    let mut first_user = !tpl.user_first.is_empty();
    let mut pos_input = 0usize;
    let mut pos_reply = 0usize;
    let user_name = engine.conf.chat.chat_user_name.clone();
    let assistant_name = engine.conf.chat.chat_assistant_name.clone();
    let fwd_disp = engine.conf.chat.fwd_disp_mode != 0;

    'dialog: loop {
        // ---------------- system prompt ----------------
        if def_sys {
            let prompt = if sys_prompt.is_empty() {
                display::color(colors, display::COL_SYS);
                print!("Enter system prompt: ");
                match read_line() {
                    Input::Text(t) => t,
                    Input::Quit => break 'dialog,
                    _ => continue 'dialog,
                }
            } else {
                std::mem::take(&mut sys_prompt)
            };
            def_sys = false;

            display::color(colors, display::COL_SYS);
            println!("forward system prompt..");
            let ids = engine.encode(&apply_template(&tpl.sys, &prompt))?;
            engine.forward_tokens(&ids, false);
            engine.mark_sys_prompt();
            if fwd_disp {
                let mut printer = TokenPrinter::new(engine);
                for &id in &ids {
                    printer.print(engine, id, None);
                }
                println!();
            }
        }

        // ---------------- user prompt ----------------
        let text = if user_prompt.is_empty() {
            display::color(colors, display::COL_USER);
            print!("{user_name}");
            match read_line() {
                Input::Text(t) => t,
                Input::Quit => break 'dialog,
                Input::ResetNew => {
                    engine.reset(false);
                    def_sys = !tpl.sys.is_empty();
                    first_user = !tpl.user_first.is_empty();
                    pos_input = 0;
                    pos_reply = 0;
                    continue 'dialog;
                }
                Input::ResetKeep => {
                    engine.reset(true);
                    first_user = !tpl.user_first.is_empty();
                    pos_input = 0;
                    pos_reply = 0;
                    continue 'dialog;
                }
                Input::Regen => {
                    if pos_reply == 0 {
                        continue 'dialog;
                    }
                    // recompute the logits of the last injected token
                    pos_reply -= 1;
                    engine.regen_at(pos_reply);
                    pos_reply += 1;
                    String::new()
                }
                Input::Forget => {
                    if pos_input != 0 {
                        engine.rewind(pos_input);
                        pos_reply = 0;
                    }
                    continue 'dialog;
                }
            }
        } else {
            std::mem::take(&mut user_prompt)
        };

        if !text.is_empty() {
            let template = if first_user { &tpl.user_first } else { &tpl.user };
            first_user = false;
            pos_input = engine.n_tokens();
            let ids = engine.encode(&apply_template(template, &text))?;
            engine.forward_tokens(&ids, true);
            if fwd_disp {
                display::color(colors, display::COL_USER);
                let mut printer = TokenPrinter::new(engine);
                for &id in &ids {
                    printer.print(engine, id, None);
                }
                println!();
            }
        }

        // reserve room for the reply, telling the user what was forgotten
        let evicted = engine.reserve_kv(REPLY_RESERVE);
        if evicted > 0 {
            display::color(colors, display::COL_SYS);
            println!(">info: cache compacted, {evicted} forgotten tokens");
            pos_input = pos_input.saturating_sub(evicted);
            pos_reply = pos_reply.saturating_sub(evicted);
        }

        // ---------------- reply ----------------
        if !text.is_empty() {
            pos_reply = engine.n_tokens();
        }
        display::color(colors, display::COL_SYS);
        print!("{assistant_name}");
        display::color(colors, display::COL_LLM);

        let mut printer = TokenPrinter::new(engine);
        let mut tail = String::new();
        loop {
            let pi = engine.sample();

            if pi.index == engine.token_eos() || pi.index == engine.token_eot() {
                // flush the end-of-turn template into the cache
                let ids = engine.encode(&tpl.end)?;
                engine.forward_tokens(&ids, false);
                break;
            }

            printer.print(engine, pi.index, Some(pi.prob));

            if let Some(sw) = &tpl.name_switch {
                push_tail(&mut tail, &engine.decode(pi.index));
                if tail.ends_with(sw.as_str()) {
                    engine.forward(pi.index, true, false);
                    break;
                }
            }

            engine.forward(pi.index, true, true);
        }
        println!();
    }

    display::color(colors, display::COL_RESET);
    info!(
        "chat ended, context {}/{} ({} forgotten)",
        engine.n_tokens(),
        engine.seq_len(),
        engine.n_tokens_del()
    );
    Ok(())
}
