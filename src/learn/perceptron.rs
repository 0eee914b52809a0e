//! Mistake-driven perceptron updates for both model families.

use super::UpdateRule;
use crate::lattice::viterbi::Workspace;
use crate::lattice::{Lattice, NULL_IDX};
use crate::model::flat::FlatModel;
use crate::model::ngram::NgramModel;
use crate::model::{CascadeModel, MistakeNorm};
use crate::sequence::Sequence;
use crate::weights::WeightVector;

/// Locates the gold path's edges, including the final boundary edge. The
/// gold path is guaranteed present in any training lattice (the filter mask
/// never drops it), so a miss is a broken cascade.
pub(crate) fn truth_edge_path(model: &NgramModel, seq: &Sequence, lattice: &Lattice) -> Vec<usize> {
    lattice
        .find_edge_path(&model.truth_states(seq), true)
        .into_iter()
        .map(|e| {
            if e == NULL_IDX {
                panic!(
                    "truth path is missing from the training lattice\n{}",
                    lattice.dump()
                );
            }
            e as usize
        })
        .collect()
}

/// Per-position argmax-vs-truth updates over an edge-free lattice.
#[derive(Debug, Clone)]
pub struct FlatPerceptron {
    pub learn_rate: f64,
}

impl Default for FlatPerceptron {
    fn default() -> Self {
        Self { learn_rate: 1.0 }
    }
}

impl UpdateRule<FlatModel> for FlatPerceptron {
    fn update_weights(
        &mut self,
        model: &FlatModel,
        seq: &Sequence,
        lattice: &Lattice,
        w: &mut dyn WeightVector,
        ws: &mut Workspace,
        _alpha: f64,
    ) -> f64 {
        ws.prepare(lattice);
        model.score_lattice_states(&*w, lattice, ws);
        let truth = model.truth_labels(seq);

        let mut mistakes = 0.0;
        for pos in 0..lattice.length() {
            let start = lattice.state_offset(pos);
            let end = lattice.state_offset(pos + 1);

            let mut max = f64::NEG_INFINITY;
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
            }
            assert_ne!(truth_idx, NULL_IDX, "truth label absent at position {}", pos);

            if argmax != truth_idx {
                mistakes += 1.0;
                model.increment(lattice, argmax as usize, w, -self.learn_rate);
                model.increment(lattice, truth_idx as usize, w, self.learn_rate);
            }
        }
        mistakes
    }
}

/// Structured perceptron over the argmax path of an order-N lattice.
#[derive(Debug, Clone)]
pub struct NgramPerceptron {
    pub learn_rate: f64,
    /// How mistakes are counted for the returned error tally.
    pub mistake_norm: MistakeNorm,
}

impl Default for NgramPerceptron {
    fn default() -> Self {
        Self {
            learn_rate: 1.0,
            mistake_norm: MistakeNorm::PerToken,
        }
    }
}

impl UpdateRule<NgramModel> for NgramPerceptron {
    fn update_weights(
        &mut self,
        model: &NgramModel,
        seq: &Sequence,
        lattice: &Lattice,
        w: &mut dyn WeightVector,
        ws: &mut Workspace,
        _alpha: f64,
    ) -> f64 {
        model.compute_edge_marginals(&*w, seq, lattice, ws, false);

        let guess = model.compute_guesses(lattice, ws);
        let truth = model.truth_labels(seq);
        let mut mistakes = 0.0;
        for (g, t) in guess.iter().zip(&truth) {
            if g != t {
                mistakes += 1.0;
            }
        }

        if mistakes > 0.0 {
            // updates run along the full paths, final boundary edge included
            let guess_edges = lattice.argmax_edge_path(&ws.alpha_args, &ws.marginals, true);
            let truth_edges = truth_edge_path(model, seq, lattice);
            for &e in &guess_edges {
                model.increment(lattice, e as usize, w, -self.learn_rate);
            }
            for &e in &truth_edges {
                model.increment(lattice, e, w, self.learn_rate);
            }
        }

        match self.mistake_norm {
            MistakeNorm::PerToken => mistakes,
            MistakeNorm::PerSequence => (mistakes > 0.0) as u32 as f64,
        }
    }
}

/// Sequence subgradient step with loss-augmented inference: the update fires
/// whenever the gold path fails to beat the Hamming-augmented argmax.
#[derive(Debug, Clone)]
pub struct NgramSequencePerceptron {
    pub learn_rate: f64,
}

impl Default for NgramSequencePerceptron {
    fn default() -> Self {
        Self { learn_rate: 1.0 }
    }
}

impl UpdateRule<NgramModel> for NgramSequencePerceptron {
    fn update_weights(
        &mut self,
        model: &NgramModel,
        seq: &Sequence,
        lattice: &Lattice,
        w: &mut dyn WeightVector,
        ws: &mut Workspace,
        _alpha: f64,
    ) -> f64 {
        model.compute_edge_marginals(&*w, seq, lattice, ws, true);

        let guess_edges = lattice.argmax_edge_path(&ws.alpha_args, &ws.marginals, true);
        let truth_edges = truth_edge_path(model, seq, lattice);

        let guess_score: f64 = guess_edges.iter().map(|&e| ws.edge_scores[e as usize]).sum();
        let truth_score: f64 = truth_edges.iter().map(|&e| ws.edge_scores[e]).sum();

        if truth_score <= guess_score {
            for &e in &guess_edges {
                model.increment(lattice, e as usize, w, -self.learn_rate);
            }
            for &e in &truth_edges {
                model.increment(lattice, e, w, self.learn_rate);
            }
            1.0
        } else {
            0.0
        }
    }
}
