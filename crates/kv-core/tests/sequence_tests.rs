use kv_core::sequence::{SamplingParams, Sequence};

#[test]
fn derived_quantities() {
    let seq = Sequence::new(vec![1, 2, 3, 4, 5], SamplingParams::default());
    assert_eq!(seq.num_blocks(4), 2);
    assert_eq!(seq.last_block_num_tokens(4), 1);
    assert_eq!(seq.block(0, 4), &[1, 2, 3, 4]);
    assert_eq!(seq.block(1, 4), &[5]);
}

#[test]
fn append_token_grows_len_and_last() {
    let mut seq = Sequence::new(vec![1, 2, 3, 4], SamplingParams::default());
    seq.append_token(9);
    assert_eq!(seq.num_tokens, 5);
    assert_eq!(seq.last_token(), 9);
    assert_eq!(seq.num_completion_tokens(), 1);
}

#[test]
fn seq_ids_are_monotonic_and_unique() {
    let a = Sequence::new(vec![1], SamplingParams::default());
    let b = Sequence::new(vec![1], SamplingParams::default());
    assert!(b.seq_id > a.seq_id);
}

#[test]
fn prompt_and_completion_split_at_num_prompt_tokens() {
    let mut seq = Sequence::new(vec![1, 2, 3], SamplingParams::default());
    seq.append_token(4);
    seq.append_token(5);
    assert_eq!(seq.prompt_token_ids(), &[1, 2, 3]);
    assert_eq!(seq.completion_token_ids(), &[4, 5]);
}

#[test]
fn snapshot_delta_is_full_on_first_transfer_and_last_token_after() {
    use kv_core::sequence::SequenceDelta;

    let mut seq = Sequence::new(vec![1, 2, 3], SamplingParams::default());
    seq.append_token(4);

    match seq.snapshot_delta(true) {
        SequenceDelta::Full { token_ids, .. } => assert_eq!(token_ids, vec![1, 2, 3, 4]),
        _ => panic!("expected a Full delta on first transfer"),
    }

    match seq.snapshot_delta(false) {
        SequenceDelta::LastToken { token, .. } => assert_eq!(token, 4),
        _ => panic!("expected a LastToken delta on a later transfer"),
    }
}
