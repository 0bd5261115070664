//! tokenizer.json loading.
//!
//! Typed deserialisation of the HuggingFace tokenizer file: `model.vocab`,
//! ranked `model.merges`, `added_tokens`, and the optional decoder pattern
//! carrying the sentence-piece whitespace marker.

use super::{MergeId, Tokenizer};
use crate::config::ModelFamily;
use crate::error::{Result, RtError};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Default sentence-piece whitespace marker (U+2581).
const SP_WS_DEFAULT: char = '\u{2581}';

#[derive(Deserialize)]
struct TokenizerFile {
    #[serde(default)]
    added_tokens: Vec<AddedToken>,
    model: ModelSection,
    #[serde(default)]
    decoder: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct AddedToken {
    id: u32,
    content: String,
}

#[derive(Deserialize)]
struct ModelSection {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    vocab: HashMap<String, u32>,
    #[serde(default)]
    merges: Vec<String>,
}

/// Pull the whitespace marker out of `decoder.decoders[].pattern.String`.
fn decoder_ws_marker(decoder: &serde_json::Value) -> Option<char> {
    let decoders = decoder.get("decoders")?.as_array()?;
    for d in decoders {
        if let Some(s) = d.get("pattern").and_then(|p| p.get("String")).and_then(|v| v.as_str()) {
            return s.chars().next();
        }
    }
    None
}

/// Replace the family's whitespace markers with plain space/newline.
fn normalize_piece(s: &str, ll3: bool, sp_ws: char) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if ll3 {
            match c {
                '\u{120}' => out.push(' '),  // 0xC4A0 pseudo space
                '\u{10A}' => out.push('\n'), // 0xC48A pseudo newline
                _ => out.push(c),
            }
        } else if c == sp_ws {
            out.push(' ');
        } else {
            out.push(c);
        }
    }
    out
}

/// Split a merge rule `"LEFT RIGHT"` at its single space.
fn split_merge(rule: &str) -> Result<(&str, &str)> {
    let mut it = rule.char_indices().filter(|(_, c)| *c == ' ');
    let (pos, _) = it
        .next()
        .ok_or_else(|| RtError::Model(format!("merge rule without space: '{rule}'")))?;
    if it.next().is_some() {
        return Err(RtError::Model(format!("merge rule with multiple spaces: '{rule}'")));
    }
    let (l, r) = rule.split_at(pos);
    let r = &r[1..];
    if l.is_empty() || r.is_empty() {
        return Err(RtError::Model(format!("merge rule with empty side: '{rule}'")));
    }
    Ok((l, r))
}

pub(super) fn load_tokenizer(path: impl AsRef<Path>, family: ModelFamily) -> Result<Tokenizer> {
    let text = std::fs::read_to_string(path.as_ref())?;
    let file: TokenizerFile = serde_json::from_str(&text)
        .map_err(|e| RtError::Model(format!("{}: {e}", path.as_ref().display())))?;

    if file.model.kind.as_deref() != Some("BPE") {
        tracing::warn!("tokenizer load: BPE model type key not found");
    }

    let ll3 = family.is_ll3_style();
    let sp_ws = file
        .decoder
        .as_ref()
        .and_then(decoder_ws_marker)
        .unwrap_or(SP_WS_DEFAULT);

    // vocab ids must be dense
    let n_vocab = file.model.vocab.len();
    let mut tokens: Vec<Option<String>> = vec![None; n_vocab];
    for (s, &id) in &file.model.vocab {
        let slot = tokens
            .get_mut(id as usize)
            .ok_or_else(|| RtError::Model(format!("vocab id {id} out of range")))?;
        if slot.is_some() {
            return Err(RtError::Model(format!("vocab id {id} defined twice")));
        }
        *slot = Some(normalize_piece(s, ll3, sp_ws));
    }

    // added tokens: ordered, contiguous, appended or shadowing an existing id
    let mut id_special_base = 0u32;
    let mut id_special_last = 0u32;
    if file.added_tokens.is_empty() {
        // no specials; keep an empty range above the vocabulary
        id_special_base = n_vocab as u32 + 1;
        id_special_last = n_vocab as u32;
    }
    for (i, at) in file.added_tokens.iter().enumerate() {
        if at.content.is_empty() {
            return Err(RtError::Model(format!("added token {} has empty content", at.id)));
        }
        if i == 0 {
            id_special_base = at.id;
        }
        if at.id != id_special_base + i as u32 {
            return Err(RtError::Model("added_tokens: ids are not a contiguous run".into()));
        }
        id_special_last = at.id;
        let idx = at.id as usize;
        if idx < tokens.len() {
            match &tokens[idx] {
                Some(s) if *s == at.content => {}
                Some(s) => {
                    return Err(RtError::Model(format!(
                        "token {} has two definitions: '{s}' and '{}'",
                        at.id, at.content
                    )));
                }
                None => tokens[idx] = Some(at.content.clone()),
            }
        } else {
            if idx != tokens.len() {
                return Err(RtError::Model(format!(
                    "added token id {} leaves a vocabulary hole",
                    at.id
                )));
            }
            tokens.push(Some(at.content.clone()));
        }
    }

    let tokens: Vec<String> = tokens
        .into_iter()
        .enumerate()
        .map(|(i, t)| t.ok_or_else(|| RtError::Model(format!("vocabulary hole at id {i}"))))
        .collect::<Result<_>>()?;

    // string-sorted index for binary search
    let mut sorted: Vec<u32> = (0..tokens.len() as u32).collect();
    sorted.sort_by(|&a, &b| tokens[a as usize].cmp(&tokens[b as usize]));

    let mut t = Tokenizer {
        mode_ll3: ll3,
        tokens,
        sorted,
        merges: Vec::new(),
        id_special_base,
        id_special_last,
        token_id_bos_ws: 0,
        token_id_0x00: 0,
        byte_fallback: false,
    };

    // merge table, ranked by file order
    if file.model.merges.is_empty() {
        return Err(RtError::Model("tokenizer load: merge rules not found".into()));
    }
    let mut merges = Vec::with_capacity(file.model.merges.len());
    for (rank, rule) in file.model.merges.iter().enumerate() {
        let (l_raw, r_raw) = split_merge(rule)?;
        let l = normalize_piece(l_raw, ll3, sp_ws);
        let r = normalize_piece(r_raw, ll3, sp_ws);
        let m = format!("{l}{r}");
        let find = |s: &str, what: &str| {
            t.find_token_id(s)
                .ok_or_else(|| RtError::Model(format!("merge rule '{rule}': no token for {what}")))
        };
        merges.push(MergeId {
            tok_id_l: find(&l, "left side")?,
            tok_id_r: find(&r, "right side")?,
            tok_id_m: find(&m, "merged string")?,
            rank: rank as u32,
        });
    }
    merges.sort_by_key(|m| (m.tok_id_l, m.tok_id_r));
    t.merges = merges;

    // byte fallback anchors and the BOS whitespace-strip token
    if !ll3 {
        let find = |s: &str| {
            t.find_token_id(s)
                .ok_or_else(|| RtError::Model(format!("failed to get token '{s}'")))
        };
        let bos = find("<s>")?;
        let id_0x00 = find("<0x00>")?;
        let id_0xff = find("<0xFF>")?;
        if id_0xff - id_0x00 != 0xff {
            return Err(RtError::Model("byte fallback token block is not contiguous".into()));
        }
        t.token_id_bos_ws = bos;
        t.token_id_0x00 = id_0x00;
        t.byte_fallback = true;
    }

    Ok(t)
}
