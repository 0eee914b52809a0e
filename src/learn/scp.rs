//! Cascade subgradient updates ("SCP"): hinge-gated steps that train for
//! accuracy and pruning efficiency at once. The same cascade parameter used
//! for mask thresholds interpolates the update between the max-marginal path
//! and the witness-weighted mean, threading the filtering objective directly
//! into the gradient.

use super::perceptron::truth_edge_path;
use super::UpdateRule;
use crate::lattice::viterbi::Workspace;
use crate::lattice::{Lattice, NULL_IDX};
use crate::model::flat::FlatModel;
use crate::model::ngram::NgramModel;
use crate::model::CascadeModel;
use crate::sequence::Sequence;
use crate::weights::WeightVector;

/// Order-N cascade update.
#[derive(Debug, Clone)]
pub struct NgramCascade {
    pub learn_rate: f64,
}

impl Default for NgramCascade {
    fn default() -> Self {
        Self { learn_rate: 1.0 }
    }
}

impl UpdateRule<NgramModel> for NgramCascade {
    fn update_weights(
        &mut self,
        model: &NgramModel,
        seq: &Sequence,
        lattice: &Lattice,
        w: &mut dyn WeightVector,
        ws: &mut Workspace,
        alpha: f64,
    ) -> f64 {
        model.compute_edge_marginals(&*w, seq, lattice, ws, false);

        let argmax_edges = lattice.argmax_edge_path(&ws.alpha_args, &ws.marginals, true);
        let truth_edges = truth_edge_path(model, seq, lattice);

        let argmax_score: f64 = argmax_edges.iter().map(|&e| ws.edge_scores[e as usize]).sum();
        let truth_score: f64 = truth_edges.iter().map(|&e| ws.edge_scores[e]).sum();

        let (mean, max) = lattice.edge_mean_max(&ws.marginals);
        ws.mean_edge_score = mean;
        ws.max_edge_score = max;
        let threshold = (1.0 - alpha) * mean + alpha * max;

        // the best final-edge marginal must be the decoded path's score;
        // anything else means the forward pass and the backtrace disagree
        if max as f32 != argmax_score as f32 {
            let start = lattice.edge_offset(lattice.length());
            let end = lattice.edge_offset(lattice.length() + 1);
            for e in start..end {
                log::error!(
                    "[{}] = {:e} [alpha={:e}]",
                    e,
                    ws.marginals[e],
                    ws.alpha_vals[lattice.left_state(e) as usize]
                );
            }
            panic!(
                "inference is broken for some reason: {} != {}",
                max, argmax_score
            );
        }

        // hinge: fire unless the truth clears the threshold by a margin that
        // scales with sequence length
        if truth_score > threshold + lattice.length() as f64 {
            return 0.0;
        }

        for &e in &truth_edges {
            model.increment(lattice, e, w, self.learn_rate);
        }
        if alpha > 0.0 {
            for &e in &argmax_edges {
                model.increment(lattice, e as usize, w, -alpha * self.learn_rate);
            }
        }

        // spread the mean term over every edge, weighted by how many
        // max-marginal witness paths it participates in
        let scaled = (1.0 - alpha) * self.learn_rate / lattice.num_edges() as f64;
        lattice.edge_witnesses(&ws.alpha_args, &ws.beta_args, &mut ws.witness);
        for e in 0..lattice.num_edges() {
            if ws.witness[e] > 0 {
                model.increment(lattice, e, w, -scaled * ws.witness[e] as f64);
            }
        }
        1.0
    }
}

/// Order-0 cascade update: the same philosophy applied per position over
/// classification states, since edge-free lattices have nothing to traverse.
#[derive(Debug, Clone)]
pub struct FlatCascade {
    pub learn_rate: f64,
}

impl Default for FlatCascade {
    fn default() -> Self {
        Self { learn_rate: 1.0 }
    }
}

impl UpdateRule<FlatModel> for FlatCascade {
    fn update_weights(
        &mut self,
        model: &FlatModel,
        seq: &Sequence,
        lattice: &Lattice,
        w: &mut dyn WeightVector,
        ws: &mut Workspace,
        alpha: f64,
    ) -> f64 {
        ws.prepare(lattice);
        model.score_lattice_states(&*w, lattice, ws);
        let truth = model.truth_labels(seq);

        let mut mistakes = 0.0;
        for pos in 0..lattice.length() {
            let start = lattice.state_offset(pos);
            let end = lattice.state_offset(pos + 1);

            let mut max = f64::NEG_INFINITY;
            let mut mean = 0.0;
            let mut argmax = NULL_IDX;
            let mut truth_idx = NULL_IDX;
            for idx in start..end {
                if ws.state_scores[idx] > max {
                    max = ws.state_scores[idx];
                    argmax = idx as i32;
                }
                if lattice.state_id(idx) == truth[pos] {
                    truth_idx = idx as i32;
                }
                mean += ws.state_scores[idx];
            }
            mean /= (end - start) as f64;
            assert_ne!(truth_idx, NULL_IDX, "truth label absent at position {}", pos);

            let threshold = (1.0 - alpha) * mean + alpha * max;
            let truth_score = ws.state_scores[truth_idx as usize];

            // unit margin per position
            if truth_score < threshold + 1.0 {
                mistakes += 1.0;

                model.increment(lattice, argmax as usize, w, -self.learn_rate * alpha);

                let scaled = (1.0 - alpha) * self.learn_rate / (end - start) as f64;
                for idx in start..end {
                    model.increment(lattice, idx, w, -scaled);
                }

                model.increment(lattice, truth_idx as usize, w, self.learn_rate);
            }
        }
        mistakes
    }
}
