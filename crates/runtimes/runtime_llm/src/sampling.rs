//! Token sampling: temperature, top-k, then top-p.

use candle_core::Tensor;

use artforge_core::error::GenerationError;

/// Per-call sampling parameters, resolved from the request and config
/// defaults before generation starts.
#[derive(Debug, Clone, Copy)]
pub struct SamplingParams {
    pub max_new_tokens: usize,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: usize,
    pub seed: u64,
}

pub struct Sampler {
    temperature: f32,
    top_p: f32,
    top_k: usize,
    rng_state: u64,
}

impl Sampler {
    pub fn new(params: &SamplingParams) -> Self {
        Self {
            // Zero temperature degenerates to division by zero; clamp.
            temperature: params.temperature.max(0.001),
            top_p: params.top_p,
            top_k: params.top_k,
            rng_state: params.seed.max(1),
        }
    }

    pub fn sample(&mut self, logits: &Tensor) -> Result<u32, GenerationError> {
        let logits = logits
            .to_dtype(candle_core::DType::F32)
            .and_then(|l| l.to_vec1::<f32>())
            .map_err(|e| GenerationError::Inference(e.to_string()))?;

        let scaled: Vec<f32> = logits.iter().map(|&x| x / self.temperature).collect();

        let max_logit = scaled.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let exp: Vec<f32> = scaled.iter().map(|&x| (x - max_logit).exp()).collect();
        let sum: f32 = exp.iter().sum();
        let probs: Vec<f32> = exp.iter().map(|&x| x / sum).collect();

        // Candidates sorted by probability, truncated by top-k first, then
        // by the top-p cumulative cutoff.
        let mut indexed: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
        indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        if self.top_k > 0 && self.top_k < indexed.len() {
            indexed.truncate(self.top_k);
        }

        if self.top_p < 1.0 {
            let mut cumsum = 0.0;
            let mut cutoff = indexed.len();
            for (i, (_, p)) in indexed.iter().enumerate() {
                cumsum += p;
                if cumsum >= self.top_p {
                    cutoff = i + 1;
                    break;
                }
            }
            indexed.truncate(cutoff);
        }

        let total: f32 = indexed.iter().map(|(_, p)| p).sum();
        let r = self.random_f32() * total;
        let mut cumsum = 0.0;
        for (idx, p) in &indexed {
            cumsum += p;
            if r < cumsum {
                return Ok(*idx as u32);
            }
        }
        Ok(indexed.last().map(|(idx, _)| *idx as u32).unwrap_or(0))
    }

    fn random_f32(&mut self) -> f32 {
        // xorshift64
        self.rng_state ^= self.rng_state << 13;
        self.rng_state ^= self.rng_state >> 7;
        self.rng_state ^= self.rng_state << 17;
        (self.rng_state as f64 / u64::MAX as f64) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn params(temperature: f32, top_p: f32, top_k: usize) -> SamplingParams {
        SamplingParams {
            max_new_tokens: 16,
            temperature,
            top_p,
            top_k,
            seed: 42,
        }
    }

    #[test]
    fn near_greedy_at_low_temperature() {
        let logits = Tensor::new(&[1.0f32, 8.0, 2.0, 0.5], &Device::Cpu).unwrap();
        let mut sampler = Sampler::new(&params(0.001, 1.0, 0));
        for _ in 0..8 {
            assert_eq!(sampler.sample(&logits).unwrap(), 1);
        }
    }

    #[test]
    fn top_k_one_is_greedy_regardless_of_temperature() {
        let logits = Tensor::new(&[0.1f32, 0.2, 5.0, 0.3], &Device::Cpu).unwrap();
        let mut sampler = Sampler::new(&params(2.0, 1.0, 1));
        for _ in 0..8 {
            assert_eq!(sampler.sample(&logits).unwrap(), 2);
        }
    }

    #[test]
    fn same_seed_same_sequence() {
        let logits = Tensor::new(&[1.0f32, 1.1, 0.9, 1.05], &Device::Cpu).unwrap();
        let mut a = Sampler::new(&params(1.0, 0.9, 40));
        let mut b = Sampler::new(&params(1.0, 0.9, 40));
        for _ in 0..16 {
            assert_eq!(a.sample(&logits).unwrap(), b.sample(&logits).unwrap());
        }
    }
}
