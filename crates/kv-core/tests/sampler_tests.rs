use kv_core::sampler::sample_with_temperature;

#[test]
fn deterministic_with_seed() {
    let logits = vec![0.1, 0.2, 0.3, 0.4];
    let a = sample_with_temperature::<rand::rngs::StdRng>(&logits, 1.0, Some(42));
    let b = sample_with_temperature::<rand::rngs::StdRng>(&logits, 1.0, Some(42));
    assert_eq!(a, b);
}

#[test]
fn low_temperature_favors_the_argmax() {
    let logits = vec![0.0, 0.0, 10.0, 0.0];
    let picked = sample_with_temperature::<rand::rngs::StdRng>(&logits, 0.01, Some(1));
    assert_eq!(picked, 2);
}

#[test]
fn empty_logits_returns_index_zero() {
    let picked = sample_with_temperature::<rand::rngs::StdRng>(&[], 1.0, Some(7));
    assert_eq!(picked, 0);
}
