use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SampleParams {
    pub temperature: f32,
    pub top_k: usize,
    pub top_p: f32,
}

impl Default for SampleParams {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            top_k: 40,
            top_p: 0.9,
        }
    }
}

impl SampleParams {
    pub fn validate(&self) -> Result<()> {
        if !self.temperature.is_finite() || self.temperature <= 0.0 {
            return Err(RuntimeError::InvalidSampleParams("temperature"));
        }
        if self.top_k == 0 {
            return Err(RuntimeError::InvalidSampleParams("top_k"));
        }
        if !self.top_p.is_finite() || self.top_p <= 0.0 || self.top_p > 1.0 {
            return Err(RuntimeError::InvalidSampleParams("top_p"));
        }
        Ok(())
    }
}

/// Seeded token sampler owned by one session.
pub struct Sampler {
    rng: StdRng,
}

impl Sampler {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }

    pub fn sample(&mut self, logits: &[f32], params: &SampleParams) -> Result<usize> {
        sample(logits, params, &mut self.rng)
    }
}

/// Draws one index from `logits`.
///
/// Order: temperature, top-k, softmax, top-p, categorical draw. The
/// returned index is always within the `top_k` highest logits and its
/// probability is never zero after filtering.
pub fn sample<R: Rng + ?Sized>(logits: &[f32], params: &SampleParams, rng: &mut R) -> Result<usize> {
    params.validate()?;
    if logits.is_empty() {
        return Err(RuntimeError::BackendStepFailed("backend returned no logits".into()));
    }

    // Apply temperature
    let scaled: Vec<f32> = logits
        .iter()
        .map(|&l| if l.is_nan() { f32::NEG_INFINITY } else { l / params.temperature })
        .collect();

    // Apply top-k; ties keep the lower index first
    let mut order: Vec<usize> = (0..scaled.len()).collect();
    order.sort_by(|&a, &b| scaled[b].total_cmp(&scaled[a]).then(a.cmp(&b)));
    order.truncate(params.top_k.min(order.len()));

    // Softmax over the survivors
    let max = scaled[order[0]];
    let mut probs: Vec<f32> = if max == f32::NEG_INFINITY {
        vec![1.0; order.len()]
    } else {
        order.iter().map(|&i| (scaled[i] - max).exp()).collect()
    };
    let total: f32 = probs.iter().sum();
    for p in &mut probs {
        *p /= total;
    }

    // Apply top-p (nucleus)
    let mut keep = probs.len();
    if params.top_p < 1.0 {
        let mut cumulative = 0.0f32;
        for (n, p) in probs.iter().enumerate() {
            cumulative += p;
            if cumulative >= params.top_p {
                keep = n + 1;
                break;
            }
        }
    }
    order.truncate(keep);
    probs.truncate(keep);

    // Sample from distribution
    let mass: f32 = probs.iter().sum();
    let target = rng.gen::<f32>() * mass;
    let mut cumulative = 0.0f32;
    for (n, p) in probs.iter().enumerate() {
        cumulative += p;
        if target < cumulative && *p > 0.0 {
            return Ok(order[n]);
        }
    }

    let last = probs.iter().rposition(|p| *p > 0.0).unwrap_or(0);
    Ok(order[last])
}
