use kv_common::Result;

#[derive(Debug, Clone, Default)]
pub struct LoadParams {
    pub n_ctx: usize,
    pub n_gpu_layers: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ModelHandle;

#[derive(Debug, Clone, Default)]
pub struct SequenceState { pub tokens: Vec<u32>, pub max_new_tokens: usize }

#[derive(Debug, Clone, Default)]
pub struct ForwardOutput { pub logits: Option<Vec<f32>>, pub token: Option<u32> }

#[derive(Debug, Clone, Default)]
pub struct KvStats;

/// The one seam the scheduler never reaches through directly: token I/O and
/// the forward pass. Implementations may fan out to tensor-parallel worker
/// processes; the scheduler only ever sees the synchronous return.
pub trait InferenceBackend: Send + Sync {
    fn load_model(&self, path: &str, params: LoadParams) -> Result<ModelHandle>;
    fn tokenize(&self, text: &str) -> Result<Vec<u32>>;
    fn detokenize(&self, tokens: &[u32]) -> Result<String>;
    fn forward(&self, requests: &mut [SequenceState]) -> Result<ForwardOutput>;
    fn kv_usage(&self) -> KvStats;
}

/// A logical handle to one tensor-parallel rank. Distributed coordination
/// across parallel workers is out of scope here; this carries only the rank
/// number so `tensor_parallel_size` is a real, observable config knob
/// instead of dead configuration surface.
#[derive(Debug, Clone, Copy)]
pub struct WorkerHandle {
    pub rank: usize,
}

/// Sizes `tensor_parallel_size - 1` secondary worker handles plus the rank-0
/// handle the caller already runs in-process, mirroring how the system this
/// was derived from spawns one subprocess per non-zero rank and keeps rank 0
/// local. No process is actually spawned: fan-out across workers is the
/// `InferenceBackend` implementation's concern, opaque to the scheduler.
pub fn worker_handles(tensor_parallel_size: usize) -> Vec<WorkerHandle> {
    (0..tensor_parallel_size.max(1)).map(|rank| WorkerHandle { rank }).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_handles_sized_by_tensor_parallel_size() {
        assert_eq!(worker_handles(1).len(), 1);
        assert_eq!(worker_handles(4).len(), 4);
        assert_eq!(worker_handles(0).len(), 1);
    }
}

#[cfg(feature = "mock")]
pub mod mock {
    use super::*;
    use rand::Rng;

    /// Deterministic stand-in backend used by tests and the CLI `run` command
    /// when no real model is configured. Tokenizes by raw byte value, which
    /// keeps tokenize/detokenize exactly invertible without a real tokenizer.
    #[derive(Default)]
    pub struct MockBackend;

    impl MockBackend { pub fn new() -> Self { Self } }

    impl InferenceBackend for MockBackend {
        fn load_model(&self, _path: &str, _params: LoadParams) -> Result<ModelHandle> {
            Ok(ModelHandle::default())
        }
        fn tokenize(&self, text: &str) -> Result<Vec<u32>> {
            // very naive: bytes as tokens
            Ok(text.as_bytes().iter().map(|b| *b as u32).collect())
        }
        fn detokenize(&self, tokens: &[u32]) -> Result<String> {
            let bytes: Vec<u8> = tokens.iter().map(|t| *t as u8).collect();
            Ok(String::from_utf8_lossy(&bytes).to_string())
        }
        fn forward(&self, _requests: &mut [SequenceState]) -> Result<ForwardOutput> {
            Ok(ForwardOutput::default())
        }
        fn kv_usage(&self) -> KvStats { KvStats::default() }
    }

    /// Samples a printable-ish token for a sequence that didn't hit EOS,
    /// so a `run`/`generate` demo against the mock backend produces
    /// non-degenerate output instead of a wall of zero tokens.
    pub fn sample_next_byte_token(rng: &mut impl Rng) -> u32 {
        rng.gen_range(0x20u32..0x7e)
    }
}

