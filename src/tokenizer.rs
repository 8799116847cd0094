//! Byte Pair Encoding (BPE) Tokenizer
//!
//! Byte-level BPE: every byte value is a base token (ids 0-255) and each
//! learned merge adds one id, `256 + merge_index`. Any byte string can be
//! encoded, so there is no unknown token.
//!
//! ## Training
//!
//! 1. Start from the raw bytes of the corpus
//! 2. Count adjacent id pairs (in parallel across chunks)
//! 3. Merge the most frequent pair into a new id; ties go to the smallest pair
//! 4. Repeat until the target vocabulary size is reached or no pair is left
//!
//! ## Encoding
//!
//! Merges are replayed in learned order. Texts larger than a few hundred KB
//! are split on whitespace near fixed offsets and the pieces encoded in
//! parallel; merges never span a split point.
//!
//! ## Example
//!
//! ```rust
//! use gpt2_trainer::BPETokenizer;
//!
//! let mut tokenizer = BPETokenizer::new();
//! tokenizer.train("hello hello world", 260);
//! let ids = tokenizer.encode("hello world");
//! assert_eq!(tokenizer.decode(&ids), "hello world");
//! ```

use crate::error::{GptError, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Number of base (single-byte) tokens
pub const BASE_VOCAB: usize = 256;

/// Byte length above which encoding is split and run in parallel
const PARALLEL_ENCODE_CHUNK: usize = 100_000;

/// Learned merge rules; the vocabulary is derived from them
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(try_from = "SavedTokenizer", into = "SavedTokenizer")]
pub struct BPETokenizer {
    merges: Vec<(usize, usize)>,
    /// Byte expansion of every id
    vocab: Vec<Vec<u8>>,
    /// Pair -> merged id
    ranks: HashMap<(usize, usize), usize>,
}

/// On-disk form: only the merge list is stored
#[derive(Serialize, Deserialize)]
struct SavedTokenizer {
    merges: Vec<(usize, usize)>,
}

impl From<BPETokenizer> for SavedTokenizer {
    fn from(t: BPETokenizer) -> Self {
        Self { merges: t.merges }
    }
}

impl TryFrom<SavedTokenizer> for BPETokenizer {
    type Error = GptError;

    fn try_from(saved: SavedTokenizer) -> Result<Self> {
        let mut tokenizer = BPETokenizer::new();
        for (a, b) in saved.merges {
            let next = tokenizer.vocab.len();
            if a >= next || b >= next {
                return Err(GptError::Tokenizer(format!(
                    "merge ({}, {}) references an id not yet defined (vocab size {})",
                    a, b, next
                )));
            }
            tokenizer.push_merge((a, b));
        }
        Ok(tokenizer)
    }
}

impl Default for BPETokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl BPETokenizer {
    /// Tokenizer with the 256 byte tokens and no merges
    pub fn new() -> Self {
        Self {
            merges: Vec::new(),
            vocab: (0..BASE_VOCAB).map(|b| vec![b as u8]).collect(),
            ranks: HashMap::new(),
        }
    }

    fn push_merge(&mut self, pair: (usize, usize)) -> usize {
        let id = self.vocab.len();
        let mut bytes = self.vocab[pair.0].clone();
        bytes.extend_from_slice(&self.vocab[pair.1]);
        self.vocab.push(bytes);
        self.merges.push(pair);
        self.ranks.insert(pair, id);
        id
    }

    /// Learn merges from `text` until the vocabulary reaches `vocab_size`
    pub fn train(&mut self, text: &str, vocab_size: usize) {
        if vocab_size <= self.vocab.len() {
            return;
        }
        let num_merges = vocab_size - self.vocab.len();
        info!(
            corpus_bytes = text.len(),
            target = vocab_size,
            "training BPE tokenizer"
        );

        let mut ids = self.encode_sequential(text);
        let mut next_ids = Vec::with_capacity(ids.len());

        for merge_idx in 0..num_merges {
            let chunk_size = 50_000.max(ids.len() / rayon::current_num_threads().max(1));
            let counts: HashMap<(usize, usize), usize> = ids
                .par_chunks(chunk_size)
                .enumerate()
                .fold(HashMap::new, |mut local, (chunk_idx, chunk)| {
                    for w in chunk.windows(2) {
                        *local.entry((w[0], w[1])).or_insert(0) += 1;
                    }
                    // pair straddling the chunk boundary
                    let end = chunk_idx * chunk_size + chunk.len();
                    if let (Some(&last), Some(&next)) = (chunk.last(), ids.get(end)) {
                        *local.entry((last, next)).or_insert(0) += 1;
                    }
                    local
                })
                .reduce(HashMap::new, |mut a, b| {
                    for (pair, count) in b {
                        *a.entry(pair).or_insert(0) += count;
                    }
                    a
                });

            // highest count, then smallest pair, so reruns learn identical merges
            let best = counts
                .into_iter()
                .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)));
            let Some((pair, count)) = best else {
                break;
            };

            let id = self.push_merge(pair);
            apply_merge(&ids, pair, id, &mut next_ids);
            std::mem::swap(&mut ids, &mut next_ids);

            if merge_idx % 50 == 0 {
                debug!(
                    merge = merge_idx + 1,
                    of = num_merges,
                    ?pair,
                    count,
                    "learned merge"
                );
            }
        }

        info!(
            vocab_size = self.vocab_size(),
            merges = self.merges.len(),
            "tokenizer training complete"
        );
    }

    /// Encode text to token ids
    pub fn encode(&self, text: &str) -> Vec<usize> {
        if text.len() <= PARALLEL_ENCODE_CHUNK * 2 {
            return self.encode_sequential(text);
        }

        split_near_whitespace(text, PARALLEL_ENCODE_CHUNK)
            .par_iter()
            .map(|piece| self.encode_sequential(piece))
            .collect::<Vec<_>>()
            .concat()
    }

    fn encode_sequential(&self, text: &str) -> Vec<usize> {
        let mut ids: Vec<usize> = text.bytes().map(usize::from).collect();
        let mut buffer = Vec::with_capacity(ids.len());
        for (rank, &pair) in self.merges.iter().enumerate() {
            if ids.len() < 2 {
                break;
            }
            apply_merge(&ids, pair, BASE_VOCAB + rank, &mut buffer);
            std::mem::swap(&mut ids, &mut buffer);
        }
        ids
    }

    /// Decode ids back to text; invalid UTF-8 is replaced, unknown ids skipped
    pub fn decode(&self, ids: &[usize]) -> String {
        let bytes: Vec<u8> = ids
            .iter()
            .filter_map(|&id| self.vocab.get(id))
            .flatten()
            .copied()
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    /// Merged id for a pair, if the pair was learned
    pub fn merge_id(&self, a: usize, b: usize) -> Option<usize> {
        self.ranks.get(&(a, b)).copied()
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    pub fn stats(&self) -> TokenizerStats {
        TokenizerStats {
            vocab_size: self.vocab.len(),
            num_merges: self.merges.len(),
            base_tokens: BASE_VOCAB,
        }
    }
}

/// Replace every non-overlapping left-to-right occurrence of `pair` with `id`
fn apply_merge(ids: &[usize], pair: (usize, usize), id: usize, out: &mut Vec<usize>) {
    out.clear();
    let mut i = 0;
    while i < ids.len() {
        if i + 1 < ids.len() && ids[i] == pair.0 && ids[i + 1] == pair.1 {
            out.push(id);
            i += 2;
        } else {
            out.push(ids[i]);
            i += 1;
        }
    }
}

/// Split after the first whitespace at or beyond every `chunk` bytes
fn split_near_whitespace(text: &str, chunk: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut start = 0;
    while start < text.len() {
        let mut end = (start + chunk).min(text.len());
        while end < text.len() && !text.is_char_boundary(end) {
            end += 1;
        }
        if let Some(offset) = text[end..].find(char::is_whitespace) {
            end += offset;
        } else {
            end = text.len();
        }
        pieces.push(&text[start..end]);
        start = end;
    }
    pieces
}

/// Statistics about a tokenizer's vocabulary
#[derive(Debug)]
pub struct TokenizerStats {
    pub vocab_size: usize,
    pub num_merges: usize,
    pub base_tokens: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untrained_roundtrip() {
        let tokenizer = BPETokenizer::new();
        for text in [
            "hello",
            "newline\nand\ttab",
            "UTF-8: café, naïve, 日本語",
            "",
        ] {
            let ids = tokenizer.encode(text);
            assert_eq!(ids.len(), text.len());
            assert_eq!(tokenizer.decode(&ids), text);
        }
    }

    #[test]
    fn test_training_learns_most_frequent_pair_first() {
        let mut tokenizer = BPETokenizer::new();
        tokenizer.train("aaab aaab aaab", 257);
        // ("a","a") appears 6 times, more than any other pair
        assert_eq!(tokenizer.merge_id(b'a' as usize, b'a' as usize), Some(256));
        assert_eq!(tokenizer.vocab_size(), 257);
    }

    #[test]
    fn test_trained_roundtrip_compresses() {
        let mut tokenizer = BPETokenizer::new();
        let text = "to be or not to be that is the question to be";
        tokenizer.train(text, 280);
        let ids = tokenizer.encode(text);
        assert!(ids.len() < text.len());
        assert!(ids.iter().all(|&id| id < tokenizer.vocab_size()));
        assert_eq!(tokenizer.decode(&ids), text);
    }

    #[test]
    fn test_training_is_deterministic() {
        let text = "abcabcabd xyzxyz abab";
        let mut a = BPETokenizer::new();
        let mut b = BPETokenizer::new();
        a.train(text, 270);
        b.train(text, 270);
        assert_eq!(a.merges, b.merges);
    }

    #[test]
    fn test_save_and_load() {
        let mut tokenizer = BPETokenizer::new();
        tokenizer.train("the cat sat on the mat the end", 265);
        let path = std::env::temp_dir().join(format!("bpe_{}.json", std::process::id()));
        tokenizer.save(&path).unwrap();
        let loaded = BPETokenizer::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded.vocab_size(), tokenizer.vocab_size());
        let text = "the mat sat";
        assert_eq!(loaded.encode(text), tokenizer.encode(text));
    }

    #[test]
    fn test_load_rejects_forward_references() {
        let bad = r#"{"merges": [[300, 1]]}"#;
        let parsed: std::result::Result<BPETokenizer, _> = serde_json::from_str(bad);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_split_covers_text() {
        let text = "word ".repeat(1000);
        let pieces = split_near_whitespace(&text, 64);
        assert!(pieces.len() > 1);
        assert_eq!(pieces.concat(), text);
    }
}
