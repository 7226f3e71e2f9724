use std::sync::atomic::{AtomicU64, Ordering};

/// Block granularity used when a `Sequence` isn't bound to a particular
/// `BlockManager` instance yet (e.g. computing `num_blocks` before
/// scheduling). The block manager itself is the source of truth once a
/// sequence has been allocated.
pub const DEFAULT_BLOCK_SIZE: usize = 256;

pub type SeqId = u64;

static SEQ_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Process-wide, monotonic, never reset for the life of the engine.
fn next_seq_id() -> SeqId {
    SEQ_COUNTER.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceStatus {
    Waiting,
    Running,
    Finished,
}

#[derive(Debug, Clone, Copy)]
pub struct SamplingParams {
    pub temperature: f32,
    pub max_tokens: usize,
    pub ignore_eos: bool,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self { temperature: 1.0, max_tokens: 64, ignore_eos: false }
    }
}

/// A compact delta for transferring sequence state, mirroring the custom
/// pickling reducer in the system this was derived from: the full token
/// history only needs to cross the wire once, afterward only the newest
/// token does.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum SequenceDelta {
    Full {
        seq_id: SeqId,
        token_ids: Vec<u32>,
        num_prompt_tokens: usize,
        num_cached_tokens: usize,
        block_table: Vec<usize>,
    },
    LastToken {
        seq_id: SeqId,
        token: u32,
        num_cached_tokens: usize,
        block_table: Vec<usize>,
    },
}

/// A single generation request. Owns its token history and sampling
/// parameters; holds only integer block ids for its KV storage, the
/// `BlockManager` owns the blocks themselves.
#[derive(Debug, Clone)]
pub struct Sequence {
    pub seq_id: SeqId,
    pub status: SequenceStatus,
    pub token_ids: Vec<u32>,
    pub num_prompt_tokens: usize,
    pub num_tokens: usize,
    pub num_cached_tokens: usize,
    pub block_table: Vec<usize>,
    pub temperature: f32,
    pub max_tokens: usize,
    pub ignore_eos: bool,
}

impl Sequence {
    pub fn new(token_ids: Vec<u32>, params: SamplingParams) -> Self {
        assert!(!token_ids.is_empty(), "sequence must have at least one token");
        let num_tokens = token_ids.len();
        Self {
            seq_id: next_seq_id(),
            status: SequenceStatus::Waiting,
            num_prompt_tokens: num_tokens,
            num_tokens,
            token_ids,
            num_cached_tokens: 0,
            block_table: Vec::new(),
            temperature: params.temperature,
            max_tokens: params.max_tokens,
            ignore_eos: params.ignore_eos,
        }
    }

    pub fn len(&self) -> usize {
        self.num_tokens
    }

    pub fn is_empty(&self) -> bool {
        self.num_tokens == 0
    }

    pub fn is_finished(&self) -> bool {
        self.status == SequenceStatus::Finished
    }

    pub fn num_completion_tokens(&self) -> usize {
        self.num_tokens - self.num_prompt_tokens
    }

    pub fn prompt_token_ids(&self) -> &[u32] {
        &self.token_ids[..self.num_prompt_tokens]
    }

    pub fn completion_token_ids(&self) -> &[u32] {
        &self.token_ids[self.num_prompt_tokens..]
    }

    pub fn last_token(&self) -> u32 {
        self.token_ids[self.num_tokens - 1]
    }

    pub fn num_cached_blocks(&self, block_size: usize) -> usize {
        self.num_cached_tokens / block_size
    }

    pub fn num_blocks(&self, block_size: usize) -> usize {
        (self.num_tokens + block_size - 1) / block_size
    }

    pub fn last_block_num_tokens(&self, block_size: usize) -> usize {
        let num_blocks = self.num_blocks(block_size);
        self.num_tokens - (num_blocks - 1) * block_size
    }

    /// Token ids covered by logical block `i`, full-size unless it's the
    /// trailing, partially filled block.
    pub fn block(&self, i: usize, block_size: usize) -> &[u32] {
        assert!(i < self.num_blocks(block_size), "block index out of bounds");
        let start = i * block_size;
        let end = ((i + 1) * block_size).min(self.token_ids.len());
        &self.token_ids[start..end]
    }

    pub fn append_token(&mut self, token_id: u32) {
        self.token_ids.push(token_id);
        self.num_tokens += 1;
    }

    pub fn snapshot_delta(&self, first_transfer: bool) -> SequenceDelta {
        if first_transfer {
            SequenceDelta::Full {
                seq_id: self.seq_id,
                token_ids: self.token_ids.clone(),
                num_prompt_tokens: self.num_prompt_tokens,
                num_cached_tokens: self.num_cached_tokens,
                block_table: self.block_table.clone(),
            }
        } else {
            SequenceDelta::LastToken {
                seq_id: self.seq_id,
                token: self.last_token(),
                num_cached_tokens: self.num_cached_tokens,
                block_table: self.block_table.clone(),
            }
        }
    }
}

