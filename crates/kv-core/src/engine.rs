use crate::scheduler::Scheduler;
use crate::sequence::{SamplingParams, SeqId, Sequence};

/// The runner contract: return exactly one sampled token per input sequence,
/// in input order. The scheduler never interprets these beyond EOS
/// comparison, and has no visibility into how the runner produced them
/// (tensor-parallel fan-out, kernel graphs, etc. are all opaque here).
pub trait ModelRunner {
    fn run(&self, seqs: &[&Sequence], is_prefill: bool) -> Vec<u32>;
}

/// Observes per-tick throughput, mirroring the `progress` argument to
/// `generate`. The default no-op keeps `step`-by-`step` callers (e.g. an
/// HTTP handler driving a single request) from paying for reporting they
/// don't want.
pub trait ProgressSink {
    fn on_tick(&mut self, is_prefill: bool, num_tokens: usize, elapsed: std::time::Duration);
    fn on_finished(&mut self, seq_id: SeqId);
}

pub struct NullProgress;
impl ProgressSink for NullProgress {
    fn on_tick(&mut self, _is_prefill: bool, _num_tokens: usize, _elapsed: std::time::Duration) {}
    fn on_finished(&mut self, _seq_id: SeqId) {}
}

/// One finished request's output, as handed back from `generate`.
pub struct GenerationOutput {
    pub seq_id: SeqId,
    pub token_ids: Vec<u32>,
}

/// Drives `schedule -> run -> postprocess` until all admitted sequences
/// finish. Owns the `Scheduler`; the model runner and progress sink are
/// supplied per call so the same engine can serve many independent
/// `generate` calls (or be driven one `step` at a time from an HTTP
/// handler).
pub struct Engine {
    scheduler: Scheduler,
}

impl Engine {
    pub fn new(
        max_num_seqs: usize,
        max_num_batched_tokens: usize,
        eos: Option<u32>,
        num_kvcache_blocks: usize,
        kvcache_block_size: usize,
    ) -> Self {
        Self {
            scheduler: Scheduler::new(max_num_seqs, max_num_batched_tokens, eos, num_kvcache_blocks, kvcache_block_size),
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn add_request(&mut self, token_ids: Vec<u32>, sampling: SamplingParams) -> SeqId {
        self.scheduler.add(Sequence::new(token_ids, sampling))
    }

    pub fn is_finished(&self) -> bool {
        self.scheduler.is_finished()
    }

    /// One engine tick. Returns outputs for any sequence that finished this
    /// tick, plus a throughput signal: positive is prefill tokens processed,
    /// negative is `-num_decoded_sequences` (one new token each).
    pub fn step(&mut self, runner: &dyn ModelRunner) -> (Vec<GenerationOutput>, i64) {
        let batch = self.scheduler.schedule();
        let seqs = self.scheduler.view(&batch.seq_ids);
        let token_ids = runner.run(&seqs, batch.is_prefill);
        assert_eq!(token_ids.len(), batch.seq_ids.len(), "runner must return one token per input sequence");

        // Pre-append lengths; `postprocess` below appends this tick's sampled
        // token to every scheduled sequence (and may remove finished ones
        // from the scheduler entirely), so the throughput count has to be
        // taken as of *after* that append, the way the original sums
        // `len(seq)` only once `postprocess` has already run this tick.
        let prefill_prompt_tokens: usize = if batch.is_prefill { seqs.iter().map(|s| s.len()).sum() } else { 0 };
        drop(seqs);

        let finished = self.scheduler.postprocess(&batch.seq_ids, &token_ids);

        let num_tokens: usize =
            if batch.is_prefill { prefill_prompt_tokens + batch.seq_ids.len() } else { batch.seq_ids.len() };
        let throughput = if batch.is_prefill { num_tokens as i64 } else { -(num_tokens as i64) };

        let outputs = finished
            .into_iter()
            .map(|f| GenerationOutput { seq_id: f.seq_id, token_ids: f.completion_token_ids })
            .collect();
        (outputs, throughput)
    }

    /// Batch façade: enqueue every prompt, drive `step` to completion, return
    /// outputs ordered by admission (`seq_id`) order.
    pub fn generate(
        &mut self,
        prompts: Vec<Vec<u32>>,
        sampling: Vec<SamplingParams>,
        runner: &dyn ModelRunner,
        mut progress: impl ProgressSink,
    ) -> Vec<GenerationOutput> {
        assert_eq!(prompts.len(), sampling.len());
        let mut order = Vec::with_capacity(prompts.len());
        for (tokens, params) in prompts.into_iter().zip(sampling.into_iter()) {
            order.push(self.add_request(tokens, params));
        }

        let mut by_id = std::collections::HashMap::new();
        while !self.is_finished() {
            let start = std::time::Instant::now();
            let (outputs, throughput) = self.step(runner);
            progress.on_tick(throughput >= 0, throughput.unsigned_abs() as usize, start.elapsed());
            for out in outputs {
                progress.on_finished(out.seq_id);
                by_id.insert(out.seq_id, out.token_ids);
            }
        }

        order
            .into_iter()
            .map(|seq_id| GenerationOutput { seq_id, token_ids: by_id.remove(&seq_id).unwrap_or_default() })
            .collect()
    }
}

