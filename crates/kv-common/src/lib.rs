pub type Result<T> = core::result::Result<T, EngineError>;

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("not implemented")]
    NotImplemented,
    #[error("{0}")]
    Message(String),
    #[error("configuration error: {0}")]
    Config(String),
}

pub mod config {
    use super::{EngineError, Result};
    use serde::Deserialize;
    use std::env;
    use std::path::PathBuf;

    /// Recognized engine configuration: scheduler/block-manager budgets plus
    /// the backend-facing knobs that stay opaque to the scheduler itself.
    #[derive(Debug, Clone, Deserialize)]
    pub struct EngineConfig {
        pub model_dir: PathBuf,
        pub max_num_batched_tokens: usize,
        pub max_num_seqs: usize,
        pub max_model_len: usize,
        pub kvcache_block_size: usize,
        /// -1 means "derive from available memory and utilization fraction".
        pub num_kvcache_blocks: i64,
        pub gpu_memory_utilization: f32,
        pub tensor_parallel_size: usize,
        pub enforce_eager: bool,
        pub eos: Option<u32>,
    }

    impl Default for EngineConfig {
        fn default() -> Self {
            Self {
                model_dir: PathBuf::from("models"),
                max_num_batched_tokens: 16384,
                max_num_seqs: 512,
                max_model_len: 4096,
                kvcache_block_size: 256,
                num_kvcache_blocks: -1,
                gpu_memory_utilization: 0.9,
                tensor_parallel_size: 1,
                enforce_eager: false,
                eos: None,
            }
        }
    }

    impl EngineConfig {
        pub fn load() -> Self {
            if let Ok(path) = env::var("KV_CONFIG") {
                let Ok(text) = std::fs::read_to_string(path) else { return Self::default() };
                let Ok(cfg) = serde_yaml::from_str::<EngineConfig>(&text) else { return Self::default() };
                return cfg;
            }
            let mut cfg = Self::default();
            if let Ok(dir) = env::var("KV_MODEL_DIR") {
                cfg.model_dir = PathBuf::from(dir);
            }
            if let Some(v) = env::var("KV_MAX_BATCHED_TOKENS").ok().and_then(|v| v.parse().ok()) {
                cfg.max_num_batched_tokens = v;
            }
            if let Some(v) = env::var("KV_MAX_NUM_SEQS").ok().and_then(|v| v.parse().ok()) {
                cfg.max_num_seqs = v;
            }
            if let Some(v) = env::var("KV_MAX_MODEL_LEN").ok().and_then(|v| v.parse().ok()) {
                cfg.max_model_len = v;
            }
            if let Some(v) = env::var("KV_BLOCK_SIZE").ok().and_then(|v| v.parse().ok()) {
                cfg.kvcache_block_size = v;
            }
            if let Some(v) = env::var("KV_NUM_BLOCKS").ok().and_then(|v| v.parse().ok()) {
                cfg.num_kvcache_blocks = v;
            }
            if let Some(v) = env::var("KV_TENSOR_PARALLEL_SIZE").ok().and_then(|v| v.parse().ok()) {
                cfg.tensor_parallel_size = v;
            }
            cfg
        }

        /// Fatal-at-startup validation: model directory presence, block size
        /// granularity, tensor-parallel range, and the batched-token vs.
        /// model-length budget relationship.
        pub fn validate(&self) -> Result<()> {
            if !self.model_dir.is_dir() {
                return Err(EngineError::Config(format!(
                    "model_dir {:?} does not exist or is not a directory",
                    self.model_dir
                )));
            }
            if self.kvcache_block_size % 256 != 0 {
                return Err(EngineError::Config(format!(
                    "kvcache_block_size must be a multiple of 256, got {}",
                    self.kvcache_block_size
                )));
            }
            if !(1..=8).contains(&self.tensor_parallel_size) {
                return Err(EngineError::Config(format!(
                    "tensor_parallel_size must be in 1..=8, got {}",
                    self.tensor_parallel_size
                )));
            }
            if self.max_num_batched_tokens < self.max_model_len {
                return Err(EngineError::Config(format!(
                    "max_num_batched_tokens ({}) must be >= max_model_len ({})",
                    self.max_num_batched_tokens, self.max_model_len
                )));
            }
            Ok(())
        }

        /// Mirrors the original's `hf_config.max_position_embeddings` clamp,
        /// applied once model metadata is available.
        pub fn clamp_to_model_max(&mut self, model_max_position_embeddings: usize) {
            self.max_model_len = self.max_model_len.min(model_max_position_embeddings);
        }

        pub fn num_blocks_or(&self, derived: usize) -> usize {
            if self.num_kvcache_blocks < 0 {
                derived
            } else {
                self.num_kvcache_blocks as usize
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn existing_dir_config() -> EngineConfig {
            EngineConfig { model_dir: PathBuf::from("."), ..Default::default() }
        }

        #[test]
        fn defaults_validate_given_an_existing_model_dir() {
            assert!(existing_dir_config().validate().is_ok());
        }

        #[test]
        fn rejects_missing_model_dir() {
            let cfg = EngineConfig { model_dir: PathBuf::from("/no/such/model/dir"), ..Default::default() };
            assert!(cfg.validate().is_err());
        }

        #[test]
        fn rejects_non_256_multiple_block_size() {
            let cfg = EngineConfig { kvcache_block_size: 300, ..existing_dir_config() };
            assert!(cfg.validate().is_err());
        }

        #[test]
        fn rejects_tensor_parallel_size_out_of_range() {
            let cfg = EngineConfig { tensor_parallel_size: 0, ..existing_dir_config() };
            assert!(cfg.validate().is_err());
            let cfg = EngineConfig { tensor_parallel_size: 9, ..existing_dir_config() };
            assert!(cfg.validate().is_err());
        }

        #[test]
        fn rejects_batched_tokens_below_model_len() {
            let cfg = EngineConfig { max_num_batched_tokens: 100, max_model_len: 4096, ..existing_dir_config() };
            assert!(cfg.validate().is_err());
        }

        #[test]
        fn clamp_to_model_max_only_shrinks() {
            let mut cfg = EngineConfig { max_model_len: 4096, ..Default::default() };
            cfg.clamp_to_model_max(2048);
            assert_eq!(cfg.max_model_len, 2048);
            cfg.clamp_to_model_max(8192);
            assert_eq!(cfg.max_model_len, 2048);
        }

        #[test]
        fn num_blocks_or_prefers_explicit_value() {
            let cfg = EngineConfig { num_kvcache_blocks: 128, ..Default::default() };
            assert_eq!(cfg.num_blocks_or(4096), 128);
            let cfg = EngineConfig { num_kvcache_blocks: -1, ..Default::default() };
            assert_eq!(cfg.num_blocks_or(4096), 4096);
        }
    }
}
