use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::features::FeatureVector;

/// Dense parameter array addressed by feature id. Implemented by the plain
/// and the averaging representation so models can score and update either.
pub trait WeightVector {
    fn len(&self) -> usize;
    fn score(&self, fv: &FeatureVector, offset: usize) -> f64;
    fn score_mixed(&self, fv: &FeatureVector, offset: usize) -> f64;
    fn increment(&mut self, fv: &FeatureVector, offset: usize, rate: f64);
    fn increment_mixed(&mut self, fv: &FeatureVector, offset: usize, rate: f64);
}

/// Plain dense weights.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Weights {
    pub w: Vec<f64>,
}

impl Weights {
    pub fn new(len: usize) -> Self {
        Self { w: vec![0.0; len] }
    }

    pub fn norm(&self) -> f64 {
        self.w.iter().map(|v| v * v).sum::<f64>().sqrt()
    }

    /// Dumps the weights as JSON, the format trained models are stored in.
    pub fn dump<W: Write>(&self, w: &mut W) -> Result<()> {
        serde_json::to_writer(w, self)?;
        Ok(())
    }

    pub fn load<R: Read>(r: &mut R) -> Result<Self> {
        Ok(serde_json::from_reader(r)?)
    }
}

impl WeightVector for Weights {
    fn len(&self) -> usize {
        self.w.len()
    }

    fn score(&self, fv: &FeatureVector, offset: usize) -> f64 {
        fv.score(&self.w, offset)
    }

    fn score_mixed(&self, fv: &FeatureVector, offset: usize) -> f64 {
        fv.score_mixed(&self.w, offset)
    }

    fn increment(&mut self, fv: &FeatureVector, offset: usize, rate: f64) {
        fv.increment(&mut self.w, offset, rate);
    }

    fn increment_mixed(&mut self, fv: &FeatureVector, offset: usize, rate: f64) {
        fv.increment_mixed(&mut self.w, offset, rate);
    }
}

/// Dense weights that also maintain the running mean of every historical
/// parameter state in O(1) amortized time per update.
///
/// Each increment of weight `i` at iteration `t` adds `t * rate` to a
/// secondary accumulator. `average` then recovers the true running mean in
/// closed form as `w[i] = ((t+1) * w[i] - updates[i]) / t`, and `unaverage`
/// inverts it exactly so training can resume. Call `next_iteration` at the
/// start of each training iteration; the average equals the mean of the
/// per-iteration final weight states.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AveragingWeights {
    w: Vec<f64>,
    updates: Vec<f64>,
    scale: f64,
    t: u64,
    averaged: bool,
}

impl AveragingWeights {
    pub fn new(len: usize) -> Self {
        Self {
            w: vec![0.0; len],
            updates: vec![0.0; len],
            scale: 1.0,
            t: 0,
            averaged: false,
        }
    }

    /// Advances the averaging denominator by one.
    pub fn next_iteration(&mut self) {
        self.t += 1;
    }

    pub fn iteration(&self) -> u64 {
        self.t
    }

    pub fn is_averaged(&self) -> bool {
        self.averaged
    }

    /// Folds the update accumulator into the live weights so that
    /// `scale * w[i]` is the running mean. Must not be called twice.
    pub fn average(&mut self) {
        assert!(!self.averaged, "can't average twice");
        self.scale = 1.0 / self.t as f64;
        let t1 = self.t as f64 + 1.0;
        for (wi, ui) in self.w.iter_mut().zip(&self.updates) {
            *wi = t1 * *wi - ui;
        }
        self.averaged = true;
    }

    /// Exact inverse of `average`; restores the live weight values.
    pub fn unaverage(&mut self) {
        assert!(self.averaged, "can't unaverage twice");
        let t1 = self.t as f64 + 1.0;
        for (wi, ui) in self.w.iter_mut().zip(&self.updates) {
            *wi = (*wi + ui) / t1;
        }
        self.scale = 1.0;
        self.averaged = false;
    }

    /// Returns a plain copy of the *averaged* weights, averaging and
    /// unaveraging around the copy if the live vector is not already in
    /// averaged state.
    pub fn copy_averaged(&mut self) -> Weights {
        let did_average = if !self.averaged {
            self.average();
            true
        } else {
            false
        };
        let w = self.w.iter().map(|v| v * self.scale).collect();
        if did_average {
            self.unaverage();
        }
        Weights { w }
    }

    pub fn norm(&self) -> f64 {
        self.w.iter().map(|v| v * v).sum::<f64>().sqrt() * self.scale
    }
}

impl WeightVector for AveragingWeights {
    fn len(&self) -> usize {
        self.w.len()
    }

    fn score(&self, fv: &FeatureVector, offset: usize) -> f64 {
        fv.score(&self.w, offset) * self.scale
    }

    fn score_mixed(&self, fv: &FeatureVector, offset: usize) -> f64 {
        fv.score_mixed(&self.w, offset) * self.scale
    }

    fn increment(&mut self, fv: &FeatureVector, offset: usize, rate: f64) {
        fv.increment(&mut self.w, offset, rate);
        fv.increment(&mut self.updates, offset, self.t as f64 * rate);
    }

    fn increment_mixed(&mut self, fv: &FeatureVector, offset: usize, rate: f64) {
        fv.increment_mixed(&mut self.w, offset, rate);
        fv.increment_mixed(&mut self.updates, offset, self.t as f64 * rate);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Deterministic xorshift so runs are reproducible without extra deps.
    struct Rng(u64);

    impl Rng {
        fn next(&mut self) -> u64 {
            let mut x = self.0;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            self.0 = x;
            x
        }

        /// Dyadic rational in [-2, 2) with 4 fractional bits; sums and
        /// products with small integers stay exact in an f64.
        fn dyadic(&mut self) -> f64 {
            ((self.next() % 64) as f64 - 32.0) / 16.0
        }
    }

    #[test]
    fn average_unaverage_is_bitwise_identity() {
        let mut rng = Rng(0x9e3779b9);
        let mut aw = AveragingWeights::new(8);
        for _ in 0..13 {
            aw.next_iteration();
            for _ in 0..3 {
                let key = (rng.next() % 8) as u32;
                let fv = FeatureVector::binary(vec![key]);
                aw.increment(&fv, 0, rng.dyadic());
            }
        }
        let before = aw.clone();
        aw.average();
        aw.unaverage();
        assert_eq!(aw.w, before.w);
        assert_eq!(aw.updates, before.updates);
        assert_eq!(aw.scale, before.scale);
    }

    #[test]
    fn average_matches_explicit_history() {
        let mut rng = Rng(42);
        let mut aw = AveragingWeights::new(4);
        let mut snapshots: Vec<Vec<f64>> = Vec::new();
        let mut naive = vec![0.0f64; 4];

        for _ in 0..10 {
            aw.next_iteration();
            let key = (rng.next() % 4) as u32;
            let rate = rng.dyadic();
            let fv = FeatureVector::binary(vec![key]);
            aw.increment(&fv, 0, rate);
            naive[key as usize] += rate;
            snapshots.push(naive.clone());
        }

        let avg = aw.copy_averaged();
        for i in 0..4 {
            let mean: f64 =
                snapshots.iter().map(|s| s[i]).sum::<f64>() / snapshots.len() as f64;
            assert!(
                (avg.w[i] - mean).abs() < 1e-12,
                "weight {}: {} vs {}",
                i,
                avg.w[i],
                mean
            );
        }
    }

    #[test]
    fn copy_averaged_leaves_live_vector_untouched() {
        let mut aw = AveragingWeights::new(2);
        aw.next_iteration();
        aw.increment(&FeatureVector::binary(vec![0]), 0, 1.0);
        aw.next_iteration();
        aw.increment(&FeatureVector::binary(vec![1]), 0, 0.5);

        let live = aw.clone();
        let _ = aw.copy_averaged();
        assert_eq!(aw.w, live.w);
        assert!(!aw.is_averaged());

        // scoring semantics also unchanged
        let fv = FeatureVector::binary(vec![0, 1]);
        assert_eq!(aw.score(&fv, 0), live.score(&fv, 0));
    }

    #[test]
    #[should_panic(expected = "can't average twice")]
    fn double_average_is_a_usage_error() {
        let mut aw = AveragingWeights::new(1);
        aw.next_iteration();
        aw.average();
        aw.average();
    }

    #[test]
    fn json_round_trip() {
        let mut w = Weights::new(3);
        w.w[1] = -2.5;
        let mut buf = Vec::new();
        w.dump(&mut buf).unwrap();
        let back = Weights::load(&mut &buf[..]).unwrap();
        assert_eq!(w.w, back.w);
    }
}
