use rand::prelude::*;

/// Temperature-scaled categorical sample over `logits`. This is as much
/// sampling strategy as the design calls for (temperature is the only
/// sampling-shape knob in `SamplingParams`); it exists for the mock backend
/// and CLI demo path to produce non-degenerate output, not as a scheduler
/// concern.
pub fn sample_with_temperature<R: Rng + ?Sized>(logits: &[f32], temperature: f32, seed: Option<u64>) -> usize {
    let mut rng: StdRng = match seed {
        Some(s) => SeedableRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    };
    if logits.is_empty() {
        return 0;
    }
    let t = temperature.max(1e-4);
    let scaled: Vec<f32> = logits.iter().map(|&l| l / t).collect();
    let max = scaled.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = scaled.iter().map(|&l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    let probs: Vec<f32> = exps.iter().map(|&e| e / sum.max(1e-9)).collect();

    let r: f32 = rng.gen();
    let mut acc = 0.0_f32;
    for (i, &p) in probs.iter().enumerate() {
        acc += p;
        if r <= acc {
            return i;
        }
    }
    probs.len() - 1
}

