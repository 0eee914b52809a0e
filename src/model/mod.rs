//! The cascade model family: one model instance per cascade level.
//!
//! A model knows how to build the lattice for its level (the entry model
//! from raw input, higher models by expanding the level below), how to score
//! a lattice against a weight vector, how to turn marginals into a prune
//! mask, and how to map weight updates back onto lattice features.

pub mod flat;
pub mod ngram;

use serde::{Deserialize, Serialize};

use crate::features::FeatureVector;
use crate::lattice::viterbi::Workspace;
use crate::lattice::Lattice;
use crate::quark::Quark;
use crate::sequence::Sequence;
use crate::weights::WeightVector;

/// Reserved label used to pad n-gram histories that reach past the start of
/// a sequence. Always the last id in the label alphabet.
pub const NULL_LABEL: &str = "[NULL]";

/// Interns `labels` and appends [`NULL_LABEL`], then freezes the alphabet.
pub fn label_alphabet<I, S>(labels: I) -> Quark
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut q = Quark::default();
    for l in labels {
        q.find_or_insert(l.as_ref());
    }
    q.find_or_insert(NULL_LABEL);
    q.stop_growth();
    q
}

/// External feature layer. Implementations build finalized feature vectors
/// against the supplied working alphabet; the core never inspects feature
/// string contents, only the resulting integer keys.
///
/// Once the alphabet's growth is stopped, generators must skip strings that
/// no longer resolve rather than emit invalid keys.
pub trait FeatureGenerator {
    /// Features of position `pos` independent of any label assignment.
    fn position_features(
        &mut self,
        seq: &Sequence,
        pos: usize,
        alphabet: &mut Quark,
    ) -> FeatureVector;

    /// Features of the history-encoded state `state` (an `order`-gram id)
    /// at `pos`.
    fn state_features(
        &mut self,
        seq: &Sequence,
        pos: usize,
        state: u32,
        order: usize,
        alphabet: &mut Quark,
    ) -> FeatureVector;

    /// Features of the transition from `prev_state` into `state` ending at
    /// `pos`.
    fn edge_features(
        &mut self,
        seq: &Sequence,
        pos: usize,
        prev_state: u32,
        state: u32,
        order: usize,
        alphabet: &mut Quark,
    ) -> FeatureVector;
}

/// The state layout a model generates when expanding a pruned base lattice.
#[derive(Debug, Default)]
pub struct StateLayout {
    pub state_ids: Vec<u32>,
    /// Base-level marginal each state was born from.
    pub carried_scores: Vec<f64>,
    pub state_pos_offsets: Vec<u32>,
}

/// Capability surface of one cascade level.
///
/// The flat entry family implements the lattice-creation half and rejects
/// the sequential operations as hard usage errors; the n-gram family is the
/// mirror image.
pub trait CascadeModel {
    /// Markov order: 0 for the flat entry model.
    fn order(&self) -> usize;

    /// Number of assignable output labels (the padding label excluded).
    fn num_labels(&self) -> usize;

    /// Size of the dense weight vector this model scores against. Fixed to
    /// the configured capacity when hashed addressing is in effect.
    fn num_features(&self) -> usize;

    fn state_to_string(&self, state: u32) -> String;

    /// Gold labels, one per position.
    fn truth_labels(&self, seq: &Sequence) -> Vec<u32>;

    /// Gold path in this model's state encoding (n-gram ids; labels
    /// themselves at order 0).
    fn truth_states(&self, seq: &Sequence) -> Vec<u32>;

    /// Builds the entry-level lattice from raw input. Only the entry model
    /// supports this.
    fn create_lattice(&mut self, seq: &Sequence) -> Lattice;

    /// Builds this level's lattice from the level below plus a prune mask
    /// over the base's marginals, then attaches whatever feature vectors
    /// this level's scoring needs.
    fn expand_lattice(
        &mut self,
        seq: &Sequence,
        base: &Lattice,
        base_marginals: &[f64],
        mask: &[bool],
    ) -> Lattice;

    /// The state-generation half of expansion: surviving base edges (or
    /// states, at the first expansion) become this level's states. Detects
    /// and fatally rejects an all-pruned position.
    fn generate_valid_states(
        &self,
        base: &Lattice,
        base_marginals: &[f64],
        mask: &[bool],
    ) -> StateLayout;

    /// States reachable by prepending one label to the history.
    fn previous_states(&self, state: u32) -> Vec<u32>;

    /// States reachable by appending one label.
    fn next_states(&self, state: u32) -> Vec<u32>;

    /// Fills `ws.state_scores` for every state in the lattice.
    fn score_lattice_states(&self, w: &dyn WeightVector, lattice: &Lattice, ws: &mut Workspace);

    /// Fills `ws.edge_scores`; each edge's score absorbs its right
    /// endpoint's state score so the DP passes read only edge scores.
    fn score_lattice_edges(&self, w: &dyn WeightVector, lattice: &Lattice, ws: &mut Workspace);

    /// Computes the survival mask over this lattice's prunable units into
    /// `ws.mask`: a unit survives iff its marginal strictly exceeds
    /// `(1-alpha)*mean + alpha*max`. Positions with a single live unit
    /// always survive, and in training mode the gold path is forced to
    /// survive so true labels are never filtered from their own signal.
    fn compute_filter_mask(
        &self,
        w: &dyn WeightVector,
        seq: &Sequence,
        lattice: &Lattice,
        ws: &mut Workspace,
        alpha: f64,
        is_training: bool,
    );

    /// Applies a weight update along the lattice unit `idx` (an edge index
    /// for sequential models, a state index at order 0).
    fn increment(&self, lattice: &Lattice, idx: usize, w: &mut dyn WeightVector, rate: f64);
}

/// Whether classification error is tallied per token or per sequence. The
/// two historical variants of the order-N trainer disagreed on the default,
/// so it is an explicit option here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MistakeNorm {
    PerToken,
    PerSequence,
}
