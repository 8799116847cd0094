//! Training data: corpus buffer, batches and the sharded batch source
//!
//! The corpus is tokenized once and shared read-only. Each process owns one
//! [`DataLoaderLite`] whose cursor walks the corpus in strides of
//! `B × T × world_size`, starting at `B × T × rank`, so process `p` reads
//! every `world_size`-th window starting at window `p`.
//!
//! ```text
//! tokens:   [ t0 t1 t2 ... t64 t65 ... ]
//! window:   tokens[pos .. pos + B*T + 1]
//! inputs:   window[..B*T]    reshaped (B, T)
//! targets:  window[1..]      reshaped (B, T)
//! ```

use crate::distributed::RunContext;
use crate::error::{GptError, Result};
use std::sync::Arc;
use tracing::{debug, info};

/// A `(batch, seq)` array of token ids in row-major order
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenIds {
    pub data: Vec<usize>,
    pub batch_size: usize,
    pub seq_len: usize,
}

impl TokenIds {
    /// # Panics
    ///
    /// Panics if `data.len() != batch_size * seq_len`
    pub fn new(data: Vec<usize>, batch_size: usize, seq_len: usize) -> Self {
        assert_eq!(
            data.len(),
            batch_size * seq_len,
            "token data length ({}) doesn't match shape ({}, {})",
            data.len(),
            batch_size,
            seq_len
        );
        Self {
            data,
            batch_size,
            seq_len,
        }
    }

    pub fn shape(&self) -> [usize; 2] {
        [self.batch_size, self.seq_len]
    }

    pub fn row(&self, b: usize) -> &[usize] {
        &self.data[b * self.seq_len..(b + 1) * self.seq_len]
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Inputs and next-token targets of identical shape
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Batch {
    pub inputs: TokenIds,
    pub targets: TokenIds,
}

/// The whole tokenized corpus, loaded once per process
#[derive(Clone, Debug)]
pub struct Corpus {
    tokens: Arc<[usize]>,
}

impl Corpus {
    pub fn from_tokens(tokens: Vec<usize>) -> Self {
        Self {
            tokens: tokens.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn tokens(&self) -> &[usize] {
        &self.tokens
    }

    /// Largest token id plus one, or zero for an empty corpus
    pub fn id_bound(&self) -> usize {
        self.tokens.iter().max().map_or(0, |&m| m + 1)
    }
}

/// Sequential, process-sharded batch source with wraparound
pub struct DataLoaderLite {
    tokens: Arc<[usize]>,
    batch_size: usize,
    seq_len: usize,
    rank: usize,
    world_size: usize,
    current_position: usize,
    epochs: usize,
}

impl DataLoaderLite {
    /// Fails if the corpus cannot supply one full stride for every process
    pub fn new(corpus: &Corpus, batch_size: usize, seq_len: usize, ctx: &RunContext) -> Result<Self> {
        let needed = batch_size * seq_len * ctx.world_size + 1;
        if batch_size == 0 || seq_len == 0 || corpus.len() < needed {
            return Err(GptError::Config(format!(
                "corpus of {} tokens is too small for batch {}x{} across {} process(es); need at least {}",
                corpus.len(),
                batch_size,
                seq_len,
                ctx.world_size,
                needed
            )));
        }

        if ctx.is_master() {
            info!(tokens = corpus.len(), "data loader ready");
            info!(
                "1 epoch = {} batches",
                corpus.len() / (batch_size * seq_len)
            );
        }

        Ok(Self {
            tokens: Arc::clone(&corpus.tokens),
            batch_size,
            seq_len,
            rank: ctx.rank,
            world_size: ctx.world_size,
            current_position: batch_size * seq_len * ctx.rank,
            epochs: 0,
        })
    }

    /// Cursor offset of the next read
    pub fn position(&self) -> usize {
        self.current_position
    }

    /// Number of times the cursor has wrapped
    pub fn epochs(&self) -> usize {
        self.epochs
    }

    fn start_position(&self) -> usize {
        self.batch_size * self.seq_len * self.rank
    }

    pub fn next_batch(&mut self) -> Batch {
        let (b, t) = (self.batch_size, self.seq_len);
        let window = &self.tokens[self.current_position..self.current_position + b * t + 1];

        let inputs = TokenIds::new(window[..b * t].to_vec(), b, t);
        let targets = TokenIds::new(window[1..].to_vec(), b, t);

        let stride = b * t * self.world_size;
        self.current_position += stride;
        if self.current_position + stride + 1 > self.tokens.len() {
            self.current_position = self.start_position();
            self.epochs += 1;
            debug!(rank = self.rank, epochs = self.epochs, "data loader wrapped");
        }

        Batch { inputs, targets }
    }
}
