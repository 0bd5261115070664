//! Merge-ranked BPE tokenizer.
//!
//! The vocabulary is held twice: by id for decode, and as a string-sorted
//! index for binary search during encode. Merges are keyed by the
//! `(left_id, right_id)` pair and ranked by file order; encoding repeatedly
//! applies the lowest-ranked mergeable pair.

mod load;

use crate::config::ModelFamily;
use crate::error::{Result, RtError};
use std::borrow::Cow;
use std::path::Path;

/// One ranked merge rule.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MergeId {
    pub tok_id_l: u32,
    pub tok_id_r: u32,
    pub tok_id_m: u32,
    pub rank: u32,
}

/// Work-list element during encode: a token and the merge rank with its
/// right neighbour (`None` when the pair is not mergeable).
#[derive(Debug, Clone, Copy)]
struct MTok {
    tok_id: u32,
    merge: Option<(u32, u32)>, // (rank, merged id)
}

pub struct Tokenizer {
    mode_ll3: bool,
    tokens: Vec<String>,
    /// Token ids sorted by their string.
    sorted: Vec<u32>,
    /// Sorted by `(tok_id_l, tok_id_r)`.
    merges: Vec<MergeId>,
    id_special_base: u32,
    id_special_last: u32,
    token_id_bos_ws: u32,
    token_id_0x00: u32,
    byte_fallback: bool,
}

impl Tokenizer {
    /// Load and index a tokenizer.json file.
    pub fn load(path: impl AsRef<Path>, family: ModelFamily) -> Result<Tokenizer> {
        load::load_tokenizer(path, family)
    }

    pub fn vocab_size(&self) -> usize {
        self.tokens.len()
    }

    /// Sentence-piece style model (strips one leading space after BOS).
    pub fn sentencepiece(&self) -> bool {
        !self.mode_ll3
    }

    /// BOS token that triggers the leading-space strip.
    pub fn bos_token(&self) -> u32 {
        self.token_id_bos_ws
    }

    pub fn is_special(&self, id: u32) -> bool {
        id >= self.id_special_base && id <= self.id_special_last
    }

    /// Raw vocabulary string of a token.
    pub fn token_str(&self, id: u32) -> &str {
        self.tokens.get(id as usize).map(|s| s.as_str()).unwrap_or("<unk>")
    }

    /// Binary search the vocabulary for an exact string.
    pub fn find_token_id(&self, s: &str) -> Option<u32> {
        self.sorted
            .binary_search_by(|&id| self.tokens[id as usize].as_str().cmp(s))
            .ok()
            .map(|i| self.sorted[i])
    }

    /// Look up a special token by its literal string.
    pub fn find_special(&self, s: &str) -> Result<u32> {
        match self.find_token_id(s) {
            Some(id) if self.is_special(id) => Ok(id),
            _ => Err(RtError::Config(format!("failed to get special token '{s}'"))),
        }
    }

    fn merge_of(&self, l: u32, r: u32) -> Option<(u32, u32)> {
        self.merges
            .binary_search_by(|m| (m.tok_id_l, m.tok_id_r).cmp(&(l, r)))
            .ok()
            .map(|i| (self.merges[i].rank, self.merges[i].tok_id_m))
    }

    /// Longest special-token literal starting at `rest`.
    fn match_special(&self, rest: &str) -> Option<(u32, usize)> {
        let mut best: Option<(u32, usize)> = None;
        for id in self.id_special_base..=self.id_special_last {
            let s = &self.tokens[id as usize];
            if rest.starts_with(s.as_str()) && best.map(|(_, l)| s.len() > l).unwrap_or(true) {
                best = Some((id, s.len()));
            }
        }
        best
    }

    /// Encode UTF-8 text into token ids.
    ///
    /// Embedded special-token literals become single tokens; between them
    /// each character seeds one token (or raw-byte fallback tokens), then
    /// adjacent pairs merge lowest-rank-first until none remain.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let mut list: Vec<MTok> = Vec::with_capacity(text.len());

        // a push that does not link scores ends any merge run
        let push = |list: &mut Vec<MTok>, id: u32, link: bool, t: &Tokenizer| {
            if link && let Some(prev) = list.last_mut() {
                prev.merge = t.merge_of(prev.tok_id, id);
            }
            list.push(MTok {
                tok_id: id,
                merge: None,
            });
        };

        let mut rest = text;
        while !rest.is_empty() {
            if rest.as_bytes()[0] == b'<'
                && let Some((id, len)) = self.match_special(rest)
            {
                push(&mut list, id, false, self);
                rest = &rest[len..];
                continue;
            }

            let c = rest.chars().next().unwrap();
            let c_len = c.len_utf8();
            let piece = &rest[..c_len];
            if let Some(id) = self.find_token_id(piece) {
                push(&mut list, id, true, self);
            } else if self.byte_fallback {
                for &b in piece.as_bytes() {
                    push(&mut list, self.token_id_0x00 + b as u32, false, self);
                }
            } else {
                return Err(RtError::Model(format!(
                    "tokenizer encode: no token for character U+{:04X}",
                    c as u32
                )));
            }
            rest = &rest[c_len..];
        }

        // repeat until no mergeable pair is left
        loop {
            let mut best: Option<(usize, u32)> = None; // (index, rank)
            for (i, mt) in list.iter().enumerate() {
                if let Some((rank, _)) = mt.merge
                    && best.map(|(_, r)| rank < r).unwrap_or(true)
                {
                    best = Some((i, rank));
                    if rank == 0 {
                        break;
                    }
                }
            }
            let Some((i, _)) = best else { break };

            let merged = list[i].merge.unwrap().1;
            list.remove(i + 1);
            list[i].tok_id = merged;

            // rescore with the new right neighbour and the left neighbour
            list[i].merge = if i + 1 < list.len() {
                self.merge_of(merged, list[i + 1].tok_id)
            } else {
                None
            };
            if i > 0 {
                list[i - 1].merge = self.merge_of(list[i - 1].tok_id, merged);
            }
        }

        Ok(list.into_iter().map(|m| m.tok_id).collect())
    }

    /// Decode a single token.
    ///
    /// Specials decode empty. Byte-fallback tokens render newline/tab for
    /// their control codes, printable ASCII for the rest of the low range,
    /// and empty otherwise (a lone byte of a multi-byte sequence has no
    /// textual form).
    pub fn decode(&self, id: u32) -> Cow<'_, str> {
        if self.is_special(id) {
            return Cow::Borrowed("");
        }
        if self.byte_fallback && id >= self.token_id_0x00 && id <= self.token_id_0x00 + 255 {
            let b = (id - self.token_id_0x00) as u8;
            return match b {
                b'\r' | b'\n' => Cow::Borrowed("\n"),
                b'\t' => Cow::Borrowed("\t"),
                0x20..=0x7e => Cow::Owned((b as char).to_string()),
                _ => Cow::Borrowed(""),
            };
        }
        Cow::Borrowed(self.token_str(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hand-built tokenizer, bypassing the json loader.
    fn build(
        tokens: &[&str],
        merges: &[(&str, &str)],
        specials: std::ops::RangeInclusive<u32>,
    ) -> Tokenizer {
        let tokens: Vec<String> = tokens.iter().map(|s| s.to_string()).collect();
        let mut sorted: Vec<u32> = (0..tokens.len() as u32).collect();
        sorted.sort_by(|&a, &b| tokens[a as usize].cmp(&tokens[b as usize]));
        let mut t = Tokenizer {
            mode_ll3: true,
            tokens,
            sorted,
            merges: Vec::new(),
            id_special_base: *specials.start(),
            id_special_last: *specials.end(),
            token_id_bos_ws: 0,
            token_id_0x00: 0,
            byte_fallback: false,
        };
        let mut ms: Vec<MergeId> = merges
            .iter()
            .enumerate()
            .map(|(rank, (l, r))| MergeId {
                tok_id_l: t.find_token_id(l).unwrap(),
                tok_id_r: t.find_token_id(r).unwrap(),
                tok_id_m: t.find_token_id(&format!("{l}{r}")).unwrap(),
                rank: rank as u32,
            })
            .collect();
        ms.sort_by_key(|m| (m.tok_id_l, m.tok_id_r));
        t.merges = ms;
        t
    }

    fn hello_tokenizer() -> Tokenizer {
        build(
            &["h", "e", "l", "o", "he", "hel", "hello", "lo"],
            &[("h", "e"), ("he", "l"), ("hel", "lo"), ("l", "o")],
            9..=8, // empty special range
        )
    }

    #[test]
    fn test_encode_merges_to_single_token() {
        let t = hello_tokenizer();
        assert_eq!(t.encode("hello").unwrap(), vec![6]);
    }

    #[test]
    fn test_encode_partial_merge() {
        let t = hello_tokenizer();
        // "helo" -> h e l o -> he l o -> hel o (no (hel,o) rule) .. wait,
        // (l,o) outranks nothing once hel is formed; he+l merges first
        let ids = t.encode("helo").unwrap();
        let strs: Vec<&str> = ids.iter().map(|&i| t.token_str(i)).collect();
        assert_eq!(strs, vec!["hel", "o"]);
    }

    #[test]
    fn test_encode_deterministic() {
        let t = hello_tokenizer();
        assert_eq!(t.encode("hellohello").unwrap(), t.encode("hellohello").unwrap());
    }

    #[test]
    fn test_encode_unknown_char_fails_without_fallback() {
        let t = hello_tokenizer();
        assert!(t.encode("hz").is_err());
    }

    #[test]
    fn test_byte_fallback_decode() {
        let mut t = hello_tokenizer();
        t.byte_fallback = true;
        t.token_id_0x00 = 100;
        assert_eq!(t.decode(100 + 0x41), "A");
        assert_eq!(t.decode(100 + 0x0A), "\n");
        assert_eq!(t.decode(100 + 0x0D), "\n");
        assert_eq!(t.decode(100 + 0x09), "\t");
        assert_eq!(t.decode(100 + 0x01), "");
        assert_eq!(t.decode(100 + 0x80), "");
    }

    #[test]
    fn test_special_tokens_encode_and_decode() {
        let t = build(
            &["a", "b", "ab", "<|end|>", "<|endx|>"],
            &[("a", "b")],
            3..=4,
        );
        // longest literal wins
        let ids = t.encode("a<|endx|>b").unwrap();
        let strs: Vec<&str> = ids.iter().map(|&i| t.token_str(i)).collect();
        assert_eq!(strs, vec!["a", "<|endx|>", "b"]);
        // specials decode to nothing
        assert_eq!(t.decode(3), "");
        assert_eq!(t.decode(4), "");
        // and merges never cross the special boundary
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn test_find_special() {
        let t = build(&["x", "<|eot|>"], &[], 1..=1);
        assert_eq!(t.find_special("<|eot|>").unwrap(), 1);
        assert!(t.find_special("x").is_err());
        assert!(t.find_special("<|nope|>").is_err());
    }
}
