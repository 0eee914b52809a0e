//! Order-N sequential model: states are base-`L` encodings of the last
//! `order` labels (most recent label in the highest digit), so neighbor
//! queries are mixed-radix arithmetic rather than table lookups.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{CascadeModel, FeatureGenerator, StateLayout, NULL_LABEL};
use crate::features::FeatureVector;
use crate::lattice::viterbi::{Viterbi, Workspace};
use crate::lattice::{Lattice, Topology, NULL_IDX};
use crate::quark::Quark;
use crate::sequence::Sequence;
use crate::weights::WeightVector;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NgramConfig {
    /// Markov order; 1 = bigram states, 2 = trigram states, and so on.
    pub order: usize,
    /// Whether per-position features are conditioned on the current label.
    /// Feature growth is explosive with this on, which is why the historical
    /// defaults disagreed; it stays an explicit choice.
    pub use_position_features: bool,
    /// Freeze the feature alphabet after precomputation so only features
    /// supported by training data are scored.
    pub supported_features_only: bool,
    /// Plug the cascade parameter in directly as the prune threshold instead
    /// of blending mean and max (only sensible for sum-product marginals).
    pub use_alpha_as_threshold: bool,
    /// Bound on the materialized feature space. Exceeding it switches the
    /// model to hashed weight addressing, decided once at precomputation.
    pub max_capacity: usize,
}

impl Default for NgramConfig {
    fn default() -> Self {
        Self {
            order: 1,
            use_position_features: true,
            supported_features_only: false,
            use_alpha_as_threshold: false,
            max_capacity: 5_000_000,
        }
    }
}

pub struct NgramModel {
    cfg: NgramConfig,
    /// Label alphabet including the trailing [`NULL_LABEL`]; its size is the
    /// radix of all state arithmetic.
    labels: Arc<Quark>,
    null_label: u32,
    full_null_state: u32,
    feature_alphabet: Quark,
    num_position_features: usize,
    use_mixing: bool,
    feature_gen: Box<dyn FeatureGenerator>,
    pub viterbi: Box<dyn Viterbi>,
}

impl NgramModel {
    pub fn new(
        cfg: NgramConfig,
        labels: Arc<Quark>,
        feature_gen: Box<dyn FeatureGenerator>,
        viterbi: Box<dyn Viterbi>,
    ) -> Self {
        assert!(cfg.order >= 1, "order is a required parameter for n-gram models");
        let null_label = labels
            .to_id(NULL_LABEL)
            .expect("label alphabet lacks the null label");
        assert_eq!(
            null_label as usize,
            labels.len() - 1,
            "null label must be the last id"
        );
        let mut model = Self {
            cfg,
            labels,
            null_label,
            full_null_state: 0,
            feature_alphabet: Quark::default(),
            num_position_features: 0,
            use_mixing: false,
            feature_gen,
            viterbi,
        };
        let possible = model.pow(model.cfg.order);
        assert!(possible <= u32::MAX as u64, "state space does not fit 32 bits");
        model.full_null_state = model.null_state(model.cfg.order);
        model
    }

    /// Radix of the state encoding (label count including the null label).
    fn radix(&self) -> u64 {
        self.labels.len() as u64
    }

    /// `radix^p`, for digit arithmetic on state ids.
    pub fn pow(&self, p: usize) -> u64 {
        let mut r = 1u64;
        for _ in 0..p {
            r *= self.radix();
        }
        r
    }

    pub fn num_possible_states(&self) -> u32 {
        self.pow(self.cfg.order) as u32
    }

    /// The all-null history of a given order.
    pub fn null_state(&self, order: usize) -> u32 {
        let mut id = 0u64;
        for i in 0..order {
            id += self.null_label as u64 * self.pow(order - i - 1);
        }
        id as u32
    }

    /// The label embedded in `ngram` at time offset `offset` (0 = current).
    pub fn label_from_ngram(&self, n: usize, ngram: u32, offset: usize) -> u32 {
        assert!(
            (ngram as u64) < self.pow(n),
            "invalid {}-gram id {}",
            n,
            ngram
        );
        if n < 2 {
            return ngram;
        }
        let digit = n - offset - 1;
        ((ngram as u64 / self.pow(digit)) % self.radix()) as u32
    }

    /// Current label of a full-order state.
    pub fn current_label(&self, state: u32) -> u32 {
        self.label_from_ngram(self.cfg.order, state, 0)
    }

    /// N-gram id over `labels[pos]`, `labels[pos-1]`, ... with null padding
    /// before the start of the sequence.
    pub fn ngram_from_labels(&self, labels: &[u32], pos: usize, n: usize) -> u32 {
        assert!(n > 0, "0-gram is an undefined n-gram");
        let mut id = 0u64;
        for p in 0..n {
            let symbol = if pos >= p {
                labels[pos - p] as u64
            } else {
                self.null_label as u64
            };
            id += symbol * self.pow(n - p - 1);
        }
        id as u32
    }

    /// N-gram id conjoining the endpoints of a base-lattice edge: the right
    /// state's digits shifted up by one, with the left state's oldest label
    /// appended at the bottom.
    pub fn ngram_from_edge(&self, base: &Lattice, edge_idx: usize) -> u32 {
        let left = base.left_state(edge_idx);
        let right = base.right_state(edge_idx);
        assert_ne!(right, NULL_IDX, "boundary edges do not induce states");
        let suffix = if left == NULL_IDX {
            self.null_label as u64
        } else {
            base.state_id(left as usize) as u64 % self.radix()
        };
        (base.state_id(right as usize) as u64 * self.radix() + suffix) as u32
    }

    /// Runs the feature layer over the training set once: a first pass for
    /// position features (their count anchors the per-label weight blocks),
    /// then a pass over gold state and edge conjunctions. Decides the
    /// addressing mode, once, from the resulting feature-space size.
    pub fn precompute_features(&mut self, train: &[Sequence]) {
        if self.cfg.use_position_features {
            for seq in train {
                for pos in 0..seq.len() {
                    let _ = self
                        .feature_gen
                        .position_features(seq, pos, &mut self.feature_alphabet);
                }
            }
        }
        self.num_position_features = self.feature_alphabet.len();

        for seq in train {
            let mut prev = self.full_null_state;
            for pos in 0..seq.len() {
                let state = self.ngram_from_labels(&seq.labels, pos, self.cfg.order);
                let _ = self.feature_gen.state_features(
                    seq,
                    pos,
                    state,
                    self.cfg.order,
                    &mut self.feature_alphabet,
                );
                let _ = self.feature_gen.edge_features(
                    seq,
                    pos,
                    prev,
                    state,
                    self.cfg.order,
                    &mut self.feature_alphabet,
                );
                prev = state;
            }
        }
        if self.cfg.supported_features_only {
            self.feature_alphabet.stop_growth();
        }

        let possible =
            self.num_position_features as u64 * self.num_possible_states() as u64;
        self.use_mixing = possible > self.cfg.max_capacity as u64;
        log::info!(
            "order-{} model: {} labels, {} position features, {} total features, mixing: {}",
            self.cfg.order,
            self.labels.len(),
            self.num_position_features,
            self.num_features(),
            self.use_mixing
        );
    }

    /// First weight index past the per-label position-feature blocks.
    fn conditional_feature_offset(&self) -> usize {
        self.num_position_features * (self.labels.len() - 1)
    }

    fn score_fv(&self, w: &dyn WeightVector, fv: &FeatureVector, offset: usize) -> f64 {
        if self.use_mixing {
            w.score_mixed(fv, offset)
        } else {
            w.score(fv, offset)
        }
    }

    fn incr_fv(&self, w: &mut dyn WeightVector, fv: &FeatureVector, offset: usize, rate: f64) {
        if self.use_mixing {
            w.increment_mixed(fv, offset, rate);
        } else {
            w.increment(fv, offset, rate);
        }
    }

    /// State scoring, optionally adding Hamming loss against `truth` for
    /// loss-augmented inference.
    fn score_states_internal(
        &self,
        w: &dyn WeightVector,
        lattice: &Lattice,
        ws: &mut Workspace,
        truth: Option<&[u32]>,
    ) {
        let n = self.conditional_feature_offset();
        for pos in 0..lattice.length() {
            for idx in lattice.state_offset(pos)..lattice.state_offset(pos + 1) {
                let label = self.current_label(lattice.state_id(idx));
                let mut s = 0.0;
                if self.cfg.use_position_features {
                    if let Some(fv_pos) = &lattice.fv_pos {
                        let offset = label as usize * self.num_position_features;
                        s += self.score_fv(w, &fv_pos[pos], offset);
                    }
                }
                if let Some(fv_state) = &lattice.fv_state {
                    s += self.score_fv(w, &fv_state[idx], n);
                }
                if let Some(truth) = truth {
                    if truth[pos] != label {
                        s += 1.0;
                    }
                }
                ws.state_scores[idx] = s;
            }
        }
    }

    fn score_edges_internal(
        &self,
        w: &dyn WeightVector,
        lattice: &Lattice,
        ws: &mut Workspace,
        truth: Option<&[u32]>,
    ) {
        self.score_states_internal(w, lattice, ws, truth);
        let n = self.conditional_feature_offset();
        let fv_edge = lattice
            .fv_edge
            .as_ref()
            .expect("lattice has no edge features");
        for e in 0..lattice.num_edges() {
            let mut s = self.score_fv(w, &fv_edge[e], n);
            let right = lattice.right_state(e);
            if right != NULL_IDX {
                s += ws.state_scores[right as usize];
            }
            ws.edge_scores[e] = s;
        }
    }

    /// Scores the lattice and runs the full forward-backward: alpha, beta,
    /// and per-edge marginals land in `ws`.
    pub fn compute_edge_marginals(
        &self,
        w: &dyn WeightVector,
        seq: &Sequence,
        lattice: &Lattice,
        ws: &mut Workspace,
        loss_augmented: bool,
    ) {
        ws.prepare(lattice);
        let truth = if loss_augmented {
            Some(self.truth_labels(seq))
        } else {
            None
        };
        self.score_edges_internal(w, lattice, ws, truth.as_deref());
        self.viterbi
            .compute_alpha(lattice, &ws.edge_scores, &mut ws.alpha_vals, &mut ws.alpha_args);
        self.viterbi
            .compute_beta(lattice, &ws.edge_scores, &mut ws.beta_vals, &mut ws.beta_args);
        self.viterbi.compute_edge_marginals(
            lattice,
            &ws.edge_scores,
            &ws.alpha_vals,
            &ws.beta_vals,
            &mut ws.marginals,
        );
    }

    /// Decoded per-position labels of the argmax path.
    pub fn compute_guesses(&self, lattice: &Lattice, ws: &Workspace) -> Vec<u32> {
        lattice
            .argmax_states(&ws.alpha_args, &ws.marginals)
            .into_iter()
            .map(|state| self.current_label(state))
            .collect()
    }
}

impl Topology for NgramModel {
    fn previous_states(&self, state: u32) -> Vec<u32> {
        CascadeModel::previous_states(self, state)
    }

    fn next_states(&self, state: u32) -> Vec<u32> {
        CascadeModel::next_states(self, state)
    }
}

impl CascadeModel for NgramModel {
    fn order(&self) -> usize {
        self.cfg.order
    }

    fn num_labels(&self) -> usize {
        self.labels.len() - 1
    }

    fn num_features(&self) -> usize {
        if self.use_mixing {
            self.cfg.max_capacity
        } else {
            self.conditional_feature_offset() + self.feature_alphabet.len()
        }
    }

    fn state_to_string(&self, state: u32) -> String {
        let mut s = String::new();
        for offset in (0..self.cfg.order).rev() {
            let label = self.label_from_ngram(self.cfg.order, state, offset);
            s.push_str(self.labels.to_str(label).unwrap_or("?"));
            if offset > 0 {
                s.push_str("->");
            }
        }
        s
    }

    fn truth_labels(&self, seq: &Sequence) -> Vec<u32> {
        seq.labels.clone()
    }

    fn truth_states(&self, seq: &Sequence) -> Vec<u32> {
        (0..seq.len())
            .map(|pos| self.ngram_from_labels(&seq.labels, pos, self.cfg.order))
            .collect()
    }

    fn create_lattice(&mut self, _seq: &Sequence) -> Lattice {
        panic!("higher-order model cannot create lattices from raw input");
    }

    fn expand_lattice(
        &mut self,
        seq: &Sequence,
        base: &Lattice,
        base_marginals: &[f64],
        mask: &[bool],
    ) -> Lattice {
        let layout = self.generate_valid_states(base, base_marginals, mask);
        let mut lattice = Lattice::from_states(
            seq.content_hash(),
            base.length(),
            layout.state_ids,
            layout.state_pos_offsets,
            layout.carried_scores,
            &*self,
        );

        let length = lattice.length();
        if self.cfg.use_position_features {
            let mut fvs = Vec::with_capacity(length);
            for pos in 0..length {
                fvs.push(
                    self.feature_gen
                        .position_features(seq, pos, &mut self.feature_alphabet),
                );
            }
            lattice.fv_pos = Some(fvs);
        }

        let mut fvs = Vec::with_capacity(lattice.num_states());
        for pos in 0..length {
            for idx in lattice.state_offset(pos)..lattice.state_offset(pos + 1) {
                fvs.push(self.feature_gen.state_features(
                    seq,
                    pos,
                    lattice.state_id(idx),
                    self.cfg.order,
                    &mut self.feature_alphabet,
                ));
            }
        }
        lattice.fv_state = Some(fvs);

        let mut fvs = Vec::with_capacity(lattice.num_edges());
        for pos in 0..=length {
            for e in lattice.edge_offset(pos)..lattice.edge_offset(pos + 1) {
                let right = lattice.right_state(e);
                let fv = if right != NULL_IDX {
                    let left = lattice.left_state(e);
                    let prev = if left == NULL_IDX {
                        self.full_null_state
                    } else {
                        lattice.state_id(left as usize)
                    };
                    self.feature_gen.edge_features(
                        seq,
                        pos,
                        prev,
                        lattice.state_id(right as usize),
                        self.cfg.order,
                        &mut self.feature_alphabet,
                    )
                } else {
                    // final boundary edges carry no features
                    FeatureVector::default()
                };
                fvs.push(fv);
            }
        }
        lattice.fv_edge = Some(fvs);

        lattice
    }

    fn generate_valid_states(
        &self,
        base: &Lattice,
        base_marginals: &[f64],
        mask: &[bool],
    ) -> StateLayout {
        let mut layout = StateLayout::default();
        layout.state_pos_offsets = vec![0; base.length() + 1];

        if base.is_zero_order() {
            // first expansion: the base has no edges, so surviving base
            // states become this level's states unchanged
            assert_eq!(
                self.cfg.order, 1,
                "order-{} model cannot expand an edge-free lattice",
                self.cfg.order
            );
            for pos in 0..base.length() {
                let mut all_pruned = true;
                for idx in base.state_offset(pos)..base.state_offset(pos + 1) {
                    if mask[idx] {
                        layout.state_ids.push(base.state_id(idx));
                        layout.carried_scores.push(base_marginals[idx]);
                        all_pruned = false;
                    }
                }
                if all_pruned {
                    panic!(
                        "broken lattice after pruning: all states at position {} pruned\n{}",
                        pos,
                        base.dump()
                    );
                }
                layout.state_pos_offsets[pos + 1] = layout.state_ids.len() as u32;
            }
        } else {
            // the final boundary edges are checked for pruning but induce no
            // states; their block sits at position length
            for pos in 0..=base.length() {
                let mut all_pruned = true;
                for e in base.edge_offset(pos)..base.edge_offset(pos + 1) {
                    if mask[e] {
                        if pos < base.length() {
                            layout.state_ids.push(self.ngram_from_edge(base, e));
                            layout.carried_scores.push(base_marginals[e]);
                        }
                        all_pruned = false;
                    }
                }
                if all_pruned {
                    panic!(
                        "lattice is broken; all edges at position {} have been pruned\n{}",
                        pos,
                        base.dump_edge_mask(base_marginals, mask)
                    );
                }
                if pos < base.length() {
                    layout.state_pos_offsets[pos + 1] = layout.state_ids.len() as u32;
                }
            }
        }
        layout
    }

    fn previous_states(&self, state: u32) -> Vec<u32> {
        let p = self.pow(self.cfg.order - 1);
        let suffix = state as u64 % p;
        (0..self.radix())
            .map(|l| (suffix * self.radix() + l) as u32)
            .collect()
    }

    fn next_states(&self, state: u32) -> Vec<u32> {
        let p = self.pow(self.cfg.order - 1);
        let shifted = state as u64 / self.radix();
        (0..self.radix()).map(|l| (l * p + shifted) as u32).collect()
    }

    fn score_lattice_states(&self, w: &dyn WeightVector, lattice: &Lattice, ws: &mut Workspace) {
        self.score_states_internal(w, lattice, ws, None);
    }

    fn score_lattice_edges(&self, w: &dyn WeightVector, lattice: &Lattice, ws: &mut Workspace) {
        self.score_edges_internal(w, lattice, ws, None);
    }

    fn compute_filter_mask(
        &self,
        w: &dyn WeightVector,
        seq: &Sequence,
        lattice: &Lattice,
        ws: &mut Workspace,
        alpha: f64,
        is_training: bool,
    ) {
        self.compute_edge_marginals(w, seq, lattice, ws, false);
        let (mean, max) = lattice.edge_mean_max(&ws.marginals);
        ws.mean_edge_score = mean;
        ws.max_edge_score = max;

        let threshold = if self.cfg.use_alpha_as_threshold {
            alpha
        } else {
            (1.0 - alpha) * mean + alpha * max
        };
        if threshold.is_nan() {
            panic!("threshold has become NaN, cannot proceed");
        }

        for pos in 0..=lattice.length() {
            let start = lattice.edge_offset(pos);
            let end = lattice.edge_offset(pos + 1);
            // a position with a single live edge has nothing to prune
            if end - start == 1 {
                ws.mask[start] = true;
            } else {
                for e in start..end {
                    ws.mask[e] = ws.marginals[e] > threshold;
                }
            }
        }

        if is_training {
            for e in lattice.find_edge_path(&self.truth_states(seq), true) {
                if e == NULL_IDX {
                    panic!(
                        "truth path is missing from the training lattice\n{}",
                        lattice.dump()
                    );
                }
                ws.mask[e as usize] = true;
            }
        }
    }

    fn increment(&self, lattice: &Lattice, idx: usize, w: &mut dyn WeightVector, rate: f64) {
        let n = self.conditional_feature_offset();

        let right = lattice.right_state(idx);
        if right != NULL_IDX {
            let right = right as usize;
            let label = self.current_label(lattice.state_id(right));
            if self.cfg.use_position_features {
                if let Some(fv_pos) = &lattice.fv_pos {
                    let pos = lattice.find_state_pos(right);
                    let offset = label as usize * self.num_position_features;
                    self.incr_fv(w, &fv_pos[pos], offset, rate);
                }
            }
            if let Some(fv_state) = &lattice.fv_state {
                self.incr_fv(w, &fv_state[right], n, rate);
            }
        }
        let fv_edge = lattice
            .fv_edge
            .as_ref()
            .expect("lattice has no edge features");
        self.incr_fv(w, &fv_edge[idx], n, rate);
    }
}
