//! Loss accounting over scored lattices: classification error, filter loss
//! (how often pruning would drop the truth) and efficiency loss (how much of
//! the lattice survives pruning), plus running tallies for generalization
//! and threshold trade-off sweeps.

use std::fmt;

use crate::lattice::viterbi::Workspace;
use crate::lattice::{Lattice, NULL_IDX};
use crate::model::flat::FlatModel;
use crate::model::ngram::NgramModel;
use crate::model::CascadeModel;
use crate::sequence::Sequence;
use crate::weights::WeightVector;

/// Picks the threshold for `pos` from either a per-position array or a
/// single lattice-wide value.
#[inline]
fn threshold_at(thresholds: &[f64], pos: usize) -> f64 {
    if thresholds.len() > 1 {
        thresholds[pos]
    } else {
        thresholds[0]
    }
}

/// Fraction of positions where the truth either was pruned upstream
/// (`NULL_IDX` in `truth_idx`) or falls at/below the threshold now.
pub fn filter_loss(
    lattice: &Lattice,
    marginals: &[f64],
    thresholds: &[f64],
    truth_idx: &[i32],
) -> f64 {
    let mut mistakes = 0.0;
    for (pos, &t) in truth_idx.iter().enumerate() {
        if t == NULL_IDX {
            mistakes += 1.0;
        } else if marginals[t as usize] <= threshold_at(thresholds, pos) {
            mistakes += 1.0;
        }
    }
    mistakes / lattice.length() as f64
}

/// Fraction of positions where the truth is already absent from the lattice.
pub fn upstream_filter_loss(lattice: &Lattice, truth_idx: &[i32]) -> f64 {
    let mistakes = truth_idx.iter().filter(|&&t| t == NULL_IDX).count();
    mistakes as f64 / lattice.length() as f64
}

/// Average fraction of unpruned states per position.
pub fn state_efficiency_loss(lattice: &Lattice, marginals: &[f64], thresholds: &[f64]) -> f64 {
    let mut loss = 0.0;
    for pos in 0..lattice.length() {
        let start = lattice.state_offset(pos);
        let end = lattice.state_offset(pos + 1);
        let threshold = threshold_at(thresholds, pos);
        let pruned = (start..end).filter(|&i| marginals[i] <= threshold).count();
        loss += 1.0 - pruned as f64 / (end - start) as f64;
    }
    loss / lattice.length() as f64
}

/// Average fraction of unpruned edges per position.
pub fn edge_efficiency_loss(lattice: &Lattice, marginals: &[f64], thresholds: &[f64]) -> f64 {
    let mut loss = 0.0;
    for pos in 0..lattice.length() {
        let start = lattice.edge_offset(pos);
        let end = lattice.edge_offset(pos + 1);
        let threshold = threshold_at(thresholds, pos);
        let pruned = (start..end).filter(|&i| marginals[i] <= threshold).count();
        loss += 1.0 - pruned as f64 / (end - start) as f64;
    }
    loss / lattice.length() as f64
}

/// Running test-set tally for one cascade level.
#[derive(Debug, Default, Clone)]
pub struct GeneralizationStats {
    pub num_sequences: usize,
    pub num_positions: usize,
    pub num_states: usize,
    pub num_edges: usize,
    pub num_possible_states: usize,
    pub total_class_error: f64,
    pub num_sequence_mistakes: usize,
    pub total_prune_error: f64,
    pub num_sequence_prune_mistakes: usize,
    pub total_prune_eff: f64,
    /// Truth already lost before this level got to prune anything.
    pub upstream_err: f64,
}

impl fmt::Display for GeneralizationStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "sequences: {} ({} with mistakes, {} with pruning mistakes)",
            self.num_sequences, self.num_sequence_mistakes, self.num_sequence_prune_mistakes
        )?;
        writeln!(
            f,
            "positions: {}, states: {}/{} possible, edges: {}",
            self.num_positions, self.num_states, self.num_possible_states, self.num_edges
        )?;
        write!(
            f,
            "class error: {:.4}, prune error: {:.4}, prune efficiency: {:.4}",
            self.total_class_error / self.num_positions.max(1) as f64,
            self.total_prune_error / self.num_sequences.max(1) as f64,
            self.total_prune_eff / self.num_sequences.max(1) as f64
        )
    }
}

/// Scores and decodes one lattice with an order-N model and folds the
/// classification and pruning outcomes into `stats`.
pub fn tally_ngram_generalization(
    model: &NgramModel,
    seq: &Sequence,
    lattice: &Lattice,
    w: &dyn WeightVector,
    ws: &mut Workspace,
    stats: &mut GeneralizationStats,
    alpha: f64,
) {
    stats.num_sequences += 1;
    stats.num_positions += lattice.length();
    stats.num_states += lattice.num_states();
    stats.num_edges += lattice.num_edges();
    stats.num_possible_states += model.num_possible_states() as usize * lattice.length();

    model.compute_edge_marginals(w, seq, lattice, ws, false);

    let guess = model.compute_guesses(lattice, ws);
    let truth = model.truth_labels(seq);
    let mistakes = guess
        .iter()
        .zip(&truth)
        .filter(|(g, t)| g != t)
        .count() as f64;
    stats.total_class_error += mistakes;
    if mistakes > 0.0 {
        stats.num_sequence_mistakes += 1;
    }

    let (mean, max) = lattice.edge_mean_max(&ws.marginals);
    let thresholds = [(1.0 - alpha) * mean + alpha * max];
    let truth_idx = lattice.find_edge_path(&model.truth_states(seq), false);

    stats.upstream_err += upstream_filter_loss(lattice, &truth_idx);
    let prune_error = filter_loss(lattice, &ws.marginals, &thresholds, &truth_idx);
    stats.total_prune_error += prune_error;
    stats.total_prune_eff += edge_efficiency_loss(lattice, &ws.marginals, &thresholds);
    if prune_error > 0.0 {
        stats.num_sequence_prune_mistakes += 1;
    }
}

/// Flat-model counterpart of `tally_ngram_generalization`, working over
/// state scores with per-position thresholds.
pub fn tally_flat_generalization(
    model: &FlatModel,
    seq: &Sequence,
    lattice: &Lattice,
    w: &dyn WeightVector,
    ws: &mut Workspace,
    stats: &mut GeneralizationStats,
    alpha: f64,
) {
    stats.num_sequences += 1;
    stats.num_positions += lattice.length();
    stats.num_states += lattice.num_states();
    stats.num_possible_states += model.num_labels() * lattice.length();

    ws.prepare(lattice);
    model.score_lattice_states(w, lattice, ws);

    let truth = model.truth_labels(seq);
    let truth_idx = lattice.find_state_path(&truth);

    // flat classification: argmax state per position
    let mut mistakes = 0.0;
    for pos in 0..lattice.length() {
        let start = lattice.state_offset(pos);
        let end = lattice.state_offset(pos + 1);
        let mut argmax = start;
        for idx in start + 1..end {
            if ws.state_scores[idx] > ws.state_scores[argmax] {
                argmax = idx;
            }
        }
        if argmax as i32 != truth_idx[pos] {
            mistakes += 1.0;
        }
    }
    stats.total_class_error += mistakes;
    if mistakes > 0.0 {
        stats.num_sequence_mistakes += 1;
    }

    let Workspace {
        state_scores,
        pos_mean,
        pos_max,
        ..
    } = ws;
    lattice.per_position_state_mean_max(state_scores, pos_mean, pos_max);
    let thresholds: Vec<f64> = (0..lattice.length())
        .map(|pos| (1.0 - alpha) * pos_mean[pos] + alpha * pos_max[pos])
        .collect();

    stats.total_prune_eff += state_efficiency_loss(lattice, state_scores, &thresholds);
    let prune_error = filter_loss(lattice, state_scores, &thresholds, &truth_idx);
    stats.total_prune_error += prune_error;
    if prune_error > 0.0 {
        stats.num_sequence_prune_mistakes += 1;
    }
}

/// Filter-vs-efficiency trade-off accumulated over a sweep of cascade
/// parameters, for picking the operating point of a level.
#[derive(Debug, Clone)]
pub struct FilterTradeoff {
    pub alphas: Vec<f64>,
    pub errs: Vec<f64>,
    pub effs: Vec<f64>,
    pub num_sequences: usize,
}

impl FilterTradeoff {
    pub fn new(alphas: Vec<f64>) -> Self {
        let n = alphas.len();
        Self {
            alphas,
            errs: vec![0.0; n],
            effs: vec![0.0; n],
            num_sequences: 0,
        }
    }

    /// Accumulates one order-N lattice whose marginals are already in `ws`.
    pub fn tally_ngram(
        &mut self,
        model: &NgramModel,
        seq: &Sequence,
        lattice: &Lattice,
        ws: &Workspace,
    ) {
        let (mean, max) = lattice.edge_mean_max(&ws.marginals);
        let truth_idx = lattice.find_edge_path(&model.truth_states(seq), false);
        for i in 0..self.alphas.len() {
            let alpha = self.alphas[i];
            let thresholds = [(1.0 - alpha) * mean + alpha * max];
            self.errs[i] += filter_loss(lattice, &ws.marginals, &thresholds, &truth_idx);
            self.effs[i] += edge_efficiency_loss(lattice, &ws.marginals, &thresholds);
        }
        self.num_sequences += 1;
    }

    /// Accumulates one flat lattice whose state scores are already in `ws`.
    pub fn tally_flat(
        &mut self,
        model: &FlatModel,
        seq: &Sequence,
        lattice: &Lattice,
        ws: &mut Workspace,
    ) {
        let truth_idx = lattice.find_state_path(&model.truth_labels(seq));
        let Workspace {
            state_scores,
            pos_mean,
            pos_max,
            ..
        } = ws;
        lattice.per_position_state_mean_max(state_scores, pos_mean, pos_max);
        for i in 0..self.alphas.len() {
            let alpha = self.alphas[i];
            let thresholds: Vec<f64> = (0..lattice.length())
                .map(|pos| (1.0 - alpha) * pos_mean[pos] + alpha * pos_max[pos])
                .collect();
            self.errs[i] += filter_loss(lattice, state_scores, &thresholds, &truth_idx);
            self.effs[i] += state_efficiency_loss(lattice, state_scores, &thresholds);
        }
        self.num_sequences += 1;
    }

    /// Largest alpha whose accumulated filter loss stays within `max_err`
    /// (errors and alphas both averaged per sequence), mirroring the
    /// threshold-tuning step between cascade levels.
    pub fn pick_alpha(&self, max_err: f64) -> Option<f64> {
        let n = self.num_sequences.max(1) as f64;
        self.alphas
            .iter()
            .zip(&self.errs)
            .filter(|(_, &err)| err / n <= max_err)
            .map(|(&a, _)| a)
            .fold(None, |best, a| match best {
                Some(b) if b >= a => Some(b),
                _ => Some(a),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lattice::tests::dense_lattice;

    #[test]
    fn filter_loss_counts_dropped_truth() {
        let l = dense_lattice(3, 2);
        let marginals = vec![1.0; l.num_edges()];
        // truth at edges 2, 3, 7; one already pruned upstream
        let truth_idx = vec![2, NULL_IDX, 7];
        assert!((upstream_filter_loss(&l, &truth_idx) - 1.0 / 3.0).abs() < 1e-12);
        // threshold below the marginals: only the upstream miss counts
        assert!((filter_loss(&l, &marginals, &[0.5], &truth_idx) - 1.0 / 3.0).abs() < 1e-12);
        // threshold at the marginals: <= prunes everything
        assert!((filter_loss(&l, &marginals, &[1.0], &truth_idx) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn efficiency_counts_survivors() {
        let l = dense_lattice(2, 2);
        // state marginals: one state above threshold per position
        let marginals = vec![1.0, 0.0, 0.0, 1.0];
        let eff = state_efficiency_loss(&l, &marginals, &[0.5]);
        assert!((eff - 0.5).abs() < 1e-12);
    }

    #[test]
    fn tradeoff_picks_largest_safe_alpha() {
        let mut t = FilterTradeoff::new(vec![0.0, 0.5, 1.0]);
        t.num_sequences = 1;
        t.errs = vec![0.0, 0.0, 0.4];
        assert_eq!(t.pick_alpha(0.1), Some(0.5));
        t.errs = vec![0.2, 0.3, 0.4];
        assert_eq!(t.pick_alpha(0.1), None);
    }
}
