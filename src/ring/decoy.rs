// src/ring/decoy.rs
use crate::error::{MixerError, MixerResult};
use crate::types::{DecoyDistribution, RingConfig};
use rand::Rng;
use secp256k1::PublicKey;
use std::collections::HashSet;

/// A historical output eligible as a ring member.
#[derive(Debug, Clone, PartialEq)]
pub struct DecoyCandidate {
    pub public_key: PublicKey,
    pub amount: f64,
    pub block_height: u64,
}

/// Selects decoys from a candidate pool by the configured age distribution.
/// Ages are measured in blocks behind the current tip.
pub struct DecoySelector {
    config: RingConfig,
}

impl DecoySelector {
    pub fn new(config: RingConfig) -> Self {
        Self { config }
    }

    /// Draws a target age from the configured distribution.
    fn sample_age<R: Rng>(&self, rng: &mut R) -> u64 {
        let min = self.config.minimum_age as f64;
        let max = self.config.maximum_age as f64;
        let span = (max - min).max(1.0);
        let age = match self.config.decoy_distribution {
            DecoyDistribution::Uniform => min + rng.r#gen::<f64>() * span,
            // favours recent outputs: density decreasing linearly with age
            DecoyDistribution::Triangular => min + span * (1.0 - rng.r#gen::<f64>().sqrt()),
            // gamma(2, 1) over the window, matching observed spend latency
            DecoyDistribution::Gamma => {
                let u1: f64 = rng.gen_range(f64::MIN_POSITIVE..1.0);
                let u2: f64 = rng.gen_range(f64::MIN_POSITIVE..1.0);
                let g = -(u1.ln() + u2.ln()); // mean 2, long right tail
                min + span * (g / 6.0).min(1.0)
            }
        };
        age.round() as u64
    }

    /// Picks `count` distinct decoys. The real key and every excluded key are
    /// never selected; candidates outside the age window are ignored.
    pub fn select<R: Rng>(
        &self,
        rng: &mut R,
        pool: &[DecoyCandidate],
        real_key: &PublicKey,
        excluded: &HashSet<PublicKey>,
        current_height: u64,
        count: usize,
    ) -> MixerResult<Vec<DecoyCandidate>> {
        let eligible: Vec<&DecoyCandidate> = pool
            .iter()
            .filter(|c| {
                let age = current_height.saturating_sub(c.block_height);
                c.public_key != *real_key
                    && !excluded.contains(&c.public_key)
                    && age >= self.config.minimum_age
                    && age <= self.config.maximum_age
            })
            .collect();

        if eligible.len() < count {
            return Err(MixerError::PoolShortage {
                currency: "decoy pool".into(),
                requested: count as f64,
            });
        }

        let mut chosen: Vec<DecoyCandidate> = Vec::with_capacity(count);
        let mut used: HashSet<PublicKey> = HashSet::new();
        let mut attempts = 0usize;
        while chosen.len() < count {
            attempts += 1;
            if attempts > count * 64 {
                // distribution keeps missing unused candidates, fall back to
                // filling from the remainder
                for c in &eligible {
                    if chosen.len() == count {
                        break;
                    }
                    if used.insert(c.public_key) {
                        chosen.push((*c).clone());
                    }
                }
                break;
            }
            let target_age = self.sample_age(rng);
            // nearest eligible candidate to the sampled age
            let candidate = eligible
                .iter()
                .filter(|c| !used.contains(&c.public_key))
                .min_by_key(|c| {
                    let age = current_height.saturating_sub(c.block_height);
                    age.abs_diff(target_age)
                });
            if let Some(c) = candidate {
                used.insert(c.public_key);
                chosen.push((*c).clone());
            }
        }
        Ok(chosen)
    }
}
