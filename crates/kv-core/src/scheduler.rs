use crate::block::BlockManager;
use crate::sequence::{SeqId, Sequence, SequenceStatus};
use std::collections::{HashMap, VecDeque};

/// A batch returned by `schedule`: which sequences to run this tick, and in
/// which phase. Prefill and decode are never mixed in the same tick.
pub struct Batch {
    pub seq_ids: Vec<SeqId>,
    pub is_prefill: bool,
}

/// A sequence that finished this tick, ready to be handed back to the
/// caller of `add_request`/`generate`.
pub struct Finished {
    pub seq_id: SeqId,
    pub completion_token_ids: Vec<u32>,
}

/// Two-phase batching over a waiting/running pair of queues, backed by a
/// bounded `BlockManager`. Single-threaded and cooperative: every method
/// here runs to completion with no suspension points, so there is nothing
/// to synchronize — the caller (the engine loop) is the serialization point
/// across ticks.
pub struct Scheduler {
    max_num_seqs: usize,
    max_num_batched_tokens: usize,
    eos: Option<u32>,
    block_manager: BlockManager,
    waiting: VecDeque<SeqId>,
    running: VecDeque<SeqId>,
    sequences: HashMap<SeqId, Sequence>,
}

impl Scheduler {
    pub fn new(
        max_num_seqs: usize,
        max_num_batched_tokens: usize,
        eos: Option<u32>,
        num_kvcache_blocks: usize,
        kvcache_block_size: usize,
    ) -> Self {
        Self {
            max_num_seqs,
            max_num_batched_tokens,
            eos,
            block_manager: BlockManager::new(num_kvcache_blocks, kvcache_block_size),
            waiting: VecDeque::new(),
            running: VecDeque::new(),
            sequences: HashMap::new(),
        }
    }

    pub fn block_manager(&self) -> &BlockManager {
        &self.block_manager
    }

    pub fn is_finished(&self) -> bool {
        self.waiting.is_empty() && self.running.is_empty()
    }

    pub fn add(&mut self, seq: Sequence) -> SeqId {
        let seq_id = seq.seq_id;
        self.sequences.insert(seq_id, seq);
        self.waiting.push_back(seq_id);
        seq_id
    }

    /// Read-only view of the sequences named by `seq_ids`, in order — this is
    /// what gets handed to `ModelRunner::run`.
    pub fn view(&self, seq_ids: &[SeqId]) -> Vec<&Sequence> {
        seq_ids.iter().map(|id| &self.sequences[id]).collect()
    }

    pub fn get(&self, seq_id: SeqId) -> Option<&Sequence> {
        self.sequences.get(&seq_id)
    }

    /// Chooses the next batch. Prefill is tried first and, if anything was
    /// admitted, returned immediately; only an empty prefill attempt falls
    /// through to decode.
    pub fn schedule(&mut self) -> Batch {
        if let Some(batch) = self.try_prefill() {
            return batch;
        }
        self.decode()
    }

    fn try_prefill(&mut self) -> Option<Batch> {
        let mut scheduled = Vec::new();
        let mut num_batched_tokens = 0usize;

        while !self.waiting.is_empty() && scheduled.len() < self.max_num_seqs {
            let seq_id = *self.waiting.front().unwrap();
            let seq = &self.sequences[&seq_id];
            let fits_tokens = num_batched_tokens + seq.len() <= self.max_num_batched_tokens;
            if !fits_tokens || !self.block_manager.can_allocate(seq) {
                break;
            }

            self.waiting.pop_front();
            let seq = self.sequences.get_mut(&seq_id).unwrap();
            self.block_manager.allocate(seq);
            num_batched_tokens += seq.len() - seq.num_cached_tokens;
            seq.status = SequenceStatus::Running;
            self.running.push_back(seq_id);
            scheduled.push(seq_id);
        }

        if scheduled.is_empty() {
            None
        } else {
            tracing::trace!(batch_size = scheduled.len(), num_batched_tokens, "prefill tick");
            Some(Batch { seq_ids: scheduled, is_prefill: true })
        }
    }

    fn decode(&mut self) -> Batch {
        let mut scheduled = Vec::new();

        while let Some(seq_id) = self.running.pop_front() {
            if scheduled.len() >= self.max_num_seqs {
                self.running.push_front(seq_id);
                break;
            }

            let mut aborted_self = false;
            while !self.block_manager.can_append(&self.sequences[&seq_id]) {
                if let Some(tail_id) = self.running.pop_back() {
                    self.preempt(tail_id);
                } else {
                    self.preempt(seq_id);
                    aborted_self = true;
                    break;
                }
            }
            if aborted_self {
                break;
            }

            let seq = self.sequences.get_mut(&seq_id).unwrap();
            self.block_manager.may_append(seq);
            scheduled.push(seq_id);
        }

        assert!(!scheduled.is_empty(), "decode phase scheduled nothing");

        // Reinsert at the front, in original order, so the next tick
        // continues in the same order.
        for &seq_id in scheduled.iter().rev() {
            self.running.push_front(seq_id);
        }

        tracing::trace!(batch_size = scheduled.len(), "decode tick");
        Batch { seq_ids: scheduled, is_prefill: false }
    }

    /// Involuntary Running -> Waiting transition: releases the sequence's
    /// blocks and puts it back at the head of `waiting` so it gets first
    /// shot at the next prefill (prefix dedup often recovers most of its KV).
    fn preempt(&mut self, seq_id: SeqId) {
        let seq = self.sequences.get_mut(&seq_id).unwrap();
        seq.status = SequenceStatus::Waiting;
        self.block_manager.deallocate(seq);
        self.waiting.push_front(seq_id);
    }

    /// Appends the sampled token to each scheduled sequence and finishes any
    /// that hit EOS or their token budget, returning finished sequences
    /// (owned, removed from internal bookkeeping) for the caller to collect.
    pub fn postprocess(&mut self, seq_ids: &[SeqId], token_ids: &[u32]) -> Vec<Finished> {
        let mut finished = Vec::new();
        for (&seq_id, &token_id) in seq_ids.iter().zip(token_ids.iter()) {
            let seq = self.sequences.get_mut(&seq_id).unwrap();
            seq.append_token(token_id);
            let hit_eos = !seq.ignore_eos && self.eos.map(|eos| eos == token_id).unwrap_or(false);
            let hit_budget = seq.num_completion_tokens() == seq.max_tokens;
            if hit_eos || hit_budget {
                seq.status = SequenceStatus::Finished;
                self.block_manager.deallocate(seq);
                self.running.retain(|&id| id != seq_id);
                let seq = self.sequences.remove(&seq_id).unwrap();
                finished.push(Finished { seq_id, completion_token_ids: seq.completion_token_ids().to_vec() });
            }
        }
        finished
    }
}

