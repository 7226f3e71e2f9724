use crate::sequence::Sequence;
use std::collections::{HashMap, HashSet, VecDeque};

/// A fixed-size slot in the KV pool. `block_id` is its index in the pool and
/// is immutable for the process lifetime; everything else describes the
/// content currently sitting in that slot.
#[derive(Debug, Clone)]
pub struct Block {
    pub block_id: usize,
    pub ref_count: usize,
    /// `None` for a partially filled block; only full blocks are hashed.
    pub hash: Option<u64>,
    pub token_ids: Vec<u32>,
}

impl Block {
    fn new(block_id: usize) -> Self {
        Self { block_id, ref_count: 0, hash: None, token_ids: Vec::new() }
    }

    fn update(&mut self, hash: u64, token_ids: Vec<u32>) {
        self.hash = Some(hash);
        self.token_ids = token_ids;
    }

    fn reset(&mut self) {
        self.ref_count = 1;
        self.hash = None;
        self.token_ids.clear();
    }
}

/// Chains a block's hash to its predecessor: `H(prefix || token_ids)`. A
/// match on block `i` implies full-prefix equality through position
/// `i * block_size`, which is what lets the scheduler count cached tokens by
/// hash lookup alone (content equality still guards every hit).
pub fn chain_hash(token_ids: &[u32], prefix: Option<u64>) -> u64 {
    use xxhash_rust::xxh64::Xxh64;
    let mut hasher = Xxh64::new(0);
    if let Some(p) = prefix {
        hasher.update(&p.to_le_bytes());
    }
    for t in token_ids {
        hasher.update(&t.to_le_bytes());
    }
    hasher.digest()
}

/// Owns the pool of KV blocks: allocates, dedups, ref-counts, and frees them.
/// The `hash -> block_id` index is a weak secondary reference; entries are
/// never purged on free, a later hit is verified by content equality, so a
/// stale pointer is harmless (see the module-level rationale in the design).
pub struct BlockManager {
    block_size: usize,
    blocks: Vec<Block>,
    free_block_ids: VecDeque<usize>,
    used_block_ids: HashSet<usize>,
    hash_to_block_id: HashMap<u64, usize>,
}

impl BlockManager {
    pub fn new(num_blocks: usize, block_size: usize) -> Self {
        assert!(num_blocks > 0, "block pool must be non-empty");
        Self {
            block_size,
            blocks: (0..num_blocks).map(Block::new).collect(),
            free_block_ids: (0..num_blocks).collect(),
            used_block_ids: HashSet::new(),
            hash_to_block_id: HashMap::new(),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_free_blocks(&self) -> usize {
        self.free_block_ids.len()
    }

    pub fn num_used_blocks(&self) -> usize {
        self.used_block_ids.len()
    }

    pub fn num_blocks_total(&self) -> usize {
        self.blocks.len()
    }

    pub fn block(&self, block_id: usize) -> &Block {
        &self.blocks[block_id]
    }

    fn claim_free_block(&mut self, block_id: usize) -> usize {
        let block = &mut self.blocks[block_id];
        assert_eq!(block.ref_count, 0, "claiming a block that's still referenced");
        block.reset();
        self.free_block_ids.retain(|&id| id != block_id);
        self.used_block_ids.insert(block_id);
        block_id
    }

    fn release_block(&mut self, block_id: usize) {
        assert_eq!(self.blocks[block_id].ref_count, 0, "releasing a referenced block");
        self.used_block_ids.remove(&block_id);
        self.free_block_ids.push_back(block_id);
    }

    /// Pure predicate, no mutation.
    pub fn can_allocate(&self, seq: &Sequence) -> bool {
        self.free_block_ids.len() >= seq.num_blocks(self.block_size)
    }

    /// Walks the sequence's logical blocks, reclaiming or sharing blocks on a
    /// chained-hash + content match and taking a fresh free block otherwise.
    /// Precondition: `seq.block_table` is empty.
    pub fn allocate(&mut self, seq: &mut Sequence) {
        assert!(seq.block_table.is_empty(), "allocate called with a non-empty block_table");
        let mut prefix_hash: Option<u64> = None;
        for i in 0..seq.num_blocks(self.block_size) {
            let token_ids = seq.block(i, self.block_size).to_vec();
            let full = token_ids.len() == self.block_size;
            let hash = if full { Some(chain_hash(&token_ids, prefix_hash)) } else { None };

            let hit_block_id = hash.and_then(|h| {
                self.hash_to_block_id
                    .get(&h)
                    .copied()
                    .filter(|&id| self.blocks[id].token_ids == token_ids)
            });

            let block_id = match hit_block_id {
                Some(id) => {
                    seq.num_cached_tokens += self.block_size;
                    if self.used_block_ids.contains(&id) {
                        self.blocks[id].ref_count += 1;
                    } else {
                        self.claim_free_block(id);
                    }
                    id
                }
                None => {
                    let id = self.free_block_ids[0];
                    self.claim_free_block(id)
                }
            };

            if let Some(h) = hash {
                self.blocks[block_id].update(h, token_ids);
                self.hash_to_block_id.insert(h, block_id);
            }
            seq.block_table.push(block_id);
            prefix_hash = hash.or(prefix_hash);
        }
    }

    /// One free block needed iff the next decoded token opens a new logical
    /// block; zero otherwise.
    pub fn can_append(&self, seq: &Sequence) -> bool {
        if seq.num_tokens % self.block_size == 1 {
            !self.free_block_ids.is_empty()
        } else {
            true
        }
    }

    /// Call after a sequence has grown by exactly one token.
    pub fn may_append(&mut self, seq: &mut Sequence) {
        let last_block_id = *seq.block_table.last().expect("may_append on a sequence with no blocks");
        match seq.num_tokens % self.block_size {
            1 => {
                assert!(self.blocks[last_block_id].hash.is_some(), "previous block should be full and hashed");
                let block_id = self.free_block_ids[0];
                self.claim_free_block(block_id);
                seq.block_table.push(block_id);
            }
            0 => {
                assert!(self.blocks[last_block_id].hash.is_none(), "last block hashed before it was full");
                let num_blocks = seq.num_blocks(self.block_size);
                let token_ids = seq.block(num_blocks - 1, self.block_size).to_vec();
                let prefix = if seq.block_table.len() > 1 {
                    self.blocks[seq.block_table[seq.block_table.len() - 2]].hash
                } else {
                    None
                };
                let hash = chain_hash(&token_ids, prefix);
                self.blocks[last_block_id].update(hash, token_ids);
                self.hash_to_block_id.insert(hash, last_block_id);
            }
            _ => {
                assert!(self.blocks[last_block_id].hash.is_none(), "partial block should be unhashed");
            }
        }
    }

    /// Releases every block the sequence references, LIFO, and resets its
    /// block table and cached-token count. A no-op on an already-empty
    /// sequence.
    pub fn deallocate(&mut self, seq: &mut Sequence) {
        for &block_id in seq.block_table.iter().rev() {
            let block = &mut self.blocks[block_id];
            block.ref_count -= 1;
            if block.ref_count == 0 {
                self.release_block(block_id);
            }
        }
        seq.num_cached_tokens = 0;
        seq.block_table.clear();
    }
}

