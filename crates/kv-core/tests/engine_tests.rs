use kv_core::{Engine, ModelRunner, NullProgress, SamplingParams, Sequence};

struct EchoRunner {
    eos: u32,
}

impl ModelRunner for EchoRunner {
    fn run(&self, seqs: &[&Sequence], is_prefill: bool) -> Vec<u32> {
        seqs.iter().map(|s| if is_prefill { s.last_token() } else { self.eos }).collect()
    }
}

#[test]
fn generate_runs_to_completion_for_multiple_prompts() {
    let mut engine = Engine::new(8, 16384, Some(9), 64, 4);
    let runner = EchoRunner { eos: 9 };
    let outputs = engine.generate(
        vec![vec![1, 2, 3], vec![4, 5, 6, 7]],
        vec![SamplingParams::default(), SamplingParams::default()],
        &runner,
        NullProgress,
    );
    assert_eq!(outputs.len(), 2);
    for out in &outputs {
        assert!(!out.token_ids.is_empty());
    }
    assert!(engine.is_finished());
}

#[test]
fn step_reports_prefill_throughput_as_prompt_tokens_plus_one_per_sequence() {
    // A prefill tick appends exactly one sampled token to every admitted
    // sequence in `postprocess`, so the reported throughput is the sum of
    // prompt lengths plus the batch size, not the bare prompt-length sum.
    let mut engine = Engine::new(8, 16384, Some(999), 64, 4);
    engine.add_request(vec![1, 2, 3], SamplingParams::default());
    engine.add_request(vec![4, 5, 6, 7, 8], SamplingParams::default());
    let runner = EchoRunner { eos: 999 };

    let (_, throughput) = engine.step(&runner);
    assert_eq!(throughput, (3 + 5 + 2) as i64);
}

#[test]
fn step_reports_decode_throughput_as_negative_batch_size() {
    let mut engine = Engine::new(8, 16384, Some(999), 64, 4);
    engine.add_request(vec![1, 2, 3, 4], SamplingParams::default());
    let runner = EchoRunner { eos: 999 };

    let (_, prefill_throughput) = engine.step(&runner);
    assert!(prefill_throughput > 0);
    let (_, decode_throughput) = engine.step(&runner);
    assert_eq!(decode_throughput, -1);
}
