//! Order-0 entry model: flat multiclass over every position, no sequential
//! dependencies. Sits only at the entry of the cascade; the sequential-only
//! operations are hard usage errors here.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{CascadeModel, FeatureGenerator, StateLayout, NULL_LABEL};
use crate::lattice::viterbi::Workspace;
use crate::lattice::Lattice;
use crate::quark::Quark;
use crate::sequence::Sequence;
use crate::weights::WeightVector;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlatConfig {
    /// Whether entry lattices materialize their state-id array or leave the
    /// ids implicit (`idx mod labels`), trading generality for footprint.
    pub store_state_ids: bool,
}

impl Default for FlatConfig {
    fn default() -> Self {
        Self { store_state_ids: false }
    }
}

pub struct FlatModel {
    cfg: FlatConfig,
    /// Shared label alphabet (with the trailing null label, which this model
    /// never assigns).
    labels: Arc<Quark>,
    feature_alphabet: Quark,
    feature_gen: Box<dyn FeatureGenerator>,
}

impl FlatModel {
    pub fn new(cfg: FlatConfig, labels: Arc<Quark>, feature_gen: Box<dyn FeatureGenerator>) -> Self {
        assert_eq!(
            labels.to_id(NULL_LABEL).map(|id| id as usize),
            Some(labels.len() - 1),
            "label alphabet lacks the trailing null label"
        );
        Self {
            cfg,
            labels,
            feature_alphabet: Quark::default(),
            feature_gen,
        }
    }

    /// Interns every position feature of the training set, then freezes the
    /// feature space.
    pub fn precompute_features(&mut self, train: &[Sequence]) {
        log::info!("computing features on {} examples", train.len());
        for seq in train {
            for pos in 0..seq.len() {
                let _ = self
                    .feature_gen
                    .position_features(seq, pos, &mut self.feature_alphabet);
            }
        }
        self.feature_alphabet.stop_growth();
        log::info!(
            "flat model initialized: {} labels, {} features, {} total",
            self.num_labels(),
            self.feature_alphabet.len(),
            self.num_features()
        );
    }

    fn position_features(&mut self, seq: &Sequence) -> Vec<crate::features::FeatureVector> {
        (0..seq.len())
            .map(|pos| {
                self.feature_gen
                    .position_features(seq, pos, &mut self.feature_alphabet)
            })
            .collect()
    }
}

impl CascadeModel for FlatModel {
    fn order(&self) -> usize {
        0
    }

    fn num_labels(&self) -> usize {
        self.labels.len() - 1
    }

    fn num_features(&self) -> usize {
        self.num_labels() * self.feature_alphabet.len()
    }

    fn state_to_string(&self, state: u32) -> String {
        self.labels.to_str(state).unwrap_or("?").to_string()
    }

    fn truth_labels(&self, seq: &Sequence) -> Vec<u32> {
        seq.labels.clone()
    }

    fn truth_states(&self, seq: &Sequence) -> Vec<u32> {
        seq.labels.clone()
    }

    fn create_lattice(&mut self, seq: &Sequence) -> Lattice {
        let mut lattice = Lattice::flat(seq, self.num_labels() as u32, self.cfg.store_state_ids);
        lattice.fv_pos = Some(self.position_features(seq));
        lattice
    }

    fn expand_lattice(
        &mut self,
        _seq: &Sequence,
        _base: &Lattice,
        _base_marginals: &[f64],
        _mask: &[bool],
    ) -> Lattice {
        panic!("bottom-level model cannot expand existing lattices");
    }

    fn generate_valid_states(
        &self,
        _base: &Lattice,
        _base_marginals: &[f64],
        _mask: &[bool],
    ) -> StateLayout {
        panic!("bottom-level model does not expand lattices");
    }

    fn previous_states(&self, _state: u32) -> Vec<u32> {
        panic!("bottom-level model has no transitions");
    }

    fn next_states(&self, _state: u32) -> Vec<u32> {
        panic!("bottom-level model has no transitions");
    }

    fn score_lattice_states(&self, w: &dyn WeightVector, lattice: &Lattice, ws: &mut Workspace) {
        let n = self.feature_alphabet.len();
        let fv_pos = lattice
            .fv_pos
            .as_ref()
            .expect("lattice has no position features");
        for pos in 0..lattice.length() {
            for idx in lattice.state_offset(pos)..lattice.state_offset(pos + 1) {
                let offset = lattice.state_id(idx) as usize * n;
                ws.state_scores[idx] = w.score(&fv_pos[pos], offset);
            }
        }
    }

    fn score_lattice_edges(&self, _w: &dyn WeightVector, _lattice: &Lattice, _ws: &mut Workspace) {
        panic!("bottom-level model has no transitions");
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
        ws.prepare(lattice);
        self.score_lattice_states(w, lattice, ws);

        let Workspace {
            state_scores,
            pos_mean,
            pos_max,
            mask,
            ..
        } = ws;
        lattice.per_position_state_mean_max(state_scores, pos_mean, pos_max);

        let truth = self.truth_labels(seq);
        for pos in 0..lattice.length() {
            let threshold = (1.0 - alpha) * pos_mean[pos] + alpha * pos_max[pos];
            for idx in lattice.state_offset(pos)..lattice.state_offset(pos + 1) {
                mask[idx] = state_scores[idx] > threshold;
                if is_training && lattice.state_id(idx) == truth[pos] {
                    mask[idx] = true;
                }
            }
        }
    }

    fn increment(&self, lattice: &Lattice, idx: usize, w: &mut dyn WeightVector, rate: f64) {
        let pos = lattice.find_state_pos(idx);
        let fv_pos = lattice
            .fv_pos
            .as_ref()
            .expect("lattice has no position features");
        let offset = lattice.state_id(idx) as usize * self.feature_alphabet.len();
        w.increment(&fv_pos[pos], offset, rate);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FeatureVector;
    use crate::model::label_alphabet;
    use crate::weights::Weights;

    /// One binary indicator per surface form.
    struct FormFeatures;

    impl FeatureGenerator for FormFeatures {
        fn position_features(
            &mut self,
            seq: &Sequence,
            pos: usize,
            alphabet: &mut Quark,
        ) -> FeatureVector {
            match alphabet.find_or_insert(&format!("w={}", seq.forms[pos])) {
                Some(id) => FeatureVector::binary(vec![id]),
                None => FeatureVector::default(),
            }
        }

        fn state_features(
            &mut self,
            _: &Sequence,
            _: usize,
            _: u32,
            _: usize,
            _: &mut Quark,
        ) -> FeatureVector {
            FeatureVector::default()
        }

        fn edge_features(
            &mut self,
            _: &Sequence,
            _: usize,
            _: u32,
            _: u32,
            _: usize,
            _: &mut Quark,
        ) -> FeatureVector {
            FeatureVector::default()
        }
    }

    fn seq(forms: &[&str], labels: &[u32]) -> Sequence {
        Sequence::new(
            0,
            forms.iter().map(|s| s.to_string()).collect(),
            labels.to_vec(),
        )
    }

    fn fitted_model() -> (FlatModel, Sequence) {
        let labels = Arc::new(label_alphabet(["A", "B"].iter()));
        let mut m = FlatModel::new(FlatConfig::default(), labels, Box::new(FormFeatures));
        let train = vec![seq(&["x", "y", "x"], &[0, 1, 0])];
        m.precompute_features(&train);
        (m, train.into_iter().next().unwrap())
    }

    #[test]
    fn scoring_uses_per_label_blocks() {
        let (mut m, s) = fitted_model();
        assert_eq!(m.num_features(), 4); // 2 labels x 2 form features

        let lattice = m.create_lattice(&s);
        let mut w = Weights::new(m.num_features());
        // label A block: [w=x, w=y]; label B block follows
        w.w = vec![1.0, 0.0, 0.0, 2.0];

        let mut ws = Workspace::default();
        ws.prepare(&lattice);
        m.score_lattice_states(&w, &lattice, &mut ws);
        // pos 0 (form x): A=1, B=0; pos 1 (form y): A=0, B=2
        assert_eq!(ws.state_scores[0], 1.0);
        assert_eq!(ws.state_scores[1], 0.0);
        assert_eq!(ws.state_scores[2], 0.0);
        assert_eq!(ws.state_scores[3], 2.0);
    }

    #[test]
    fn mask_keeps_truth_in_training_mode() {
        let (mut m, s) = fitted_model();
        let lattice = m.create_lattice(&s);
        let w = Weights::new(m.num_features());
        let mut ws = Workspace::default();

        // zero weights: nothing clears the strict threshold, but the truth
        // must survive anyway
        m.compute_filter_mask(&w, &s, &lattice, &mut ws, 0.5, true);
        let truth_idx = lattice.find_state_path(&s.labels);
        for (pos, &idx) in truth_idx.iter().enumerate() {
            assert!(ws.mask[idx as usize], "truth pruned at {}", pos);
        }
    }

    #[test]
    #[should_panic(expected = "no transitions")]
    fn sequential_ops_are_rejected() {
        let (m, _) = fitted_model();
        CascadeModel::next_states(&m, 0);
    }

    #[test]
    fn increment_moves_scores() {
        let (mut m, s) = fitted_model();
        let lattice = m.create_lattice(&s);
        let mut w = Weights::new(m.num_features());
        let mut ws = Workspace::default();
        ws.prepare(&lattice);

        // bump state B at position 1 (linear index 3)
        m.increment(&lattice, 3, &mut w, 2.0);
        m.score_lattice_states(&w, &lattice, &mut ws);
        assert_eq!(ws.state_scores[3], 2.0);
        assert_eq!(ws.state_scores[1], 0.0);
    }
}
