//! Cascaded structured prediction for sequence labeling.
//!
//! A cascade is a chain of increasingly expressive Markov-order models. Each
//! level scores a sparse lattice of candidate label sequences, prunes
//! continuations whose marginals fall below a mean/max-blended threshold,
//! and expands the survivors into the next level's lattice, so the expensive
//! high-order models only ever see a thin slice of the full search space.
//!
//! The pieces, bottom up: [`features::FeatureVector`] and
//! [`weights::AveragingWeights`] for sparse scoring against dense
//! parameters; [`lattice::Lattice`] with the [`lattice::viterbi`] engine
//! (max-sum and sum-product over a reusable workspace); the
//! [`model::CascadeModel`] family ([`model::flat::FlatModel`] at the entry,
//! [`model::ngram::NgramModel`] above it); and the [`learn`] update rules
//! that train each level for both accuracy and pruning efficiency.
//!
//! A typical level of the training loop:
//!
//! ```ignore
//! let mut ws = Workspace::default();
//! for epoch in 0..epochs {
//!     w.next_iteration();
//!     for (seq, lattice) in corpus.iter() {
//!         rule.update_weights(&model, seq, lattice, &mut w, &mut ws, alpha);
//!     }
//! }
//! model.compute_filter_mask(&w.copy_averaged(), seq, lattice, &mut ws, alpha, true);
//! let next = next_model.expand_lattice(seq, lattice, &ws.marginals, &ws.mask);
//! ```

pub mod error;
pub mod features;
pub mod io;
pub mod lattice;
pub mod learn;
pub mod model;
pub mod quark;
pub mod sequence;
pub mod weights;
mod wire;

pub use error::{Error, Result};
pub use features::FeatureVector;
pub use lattice::viterbi::{MaxSum, SumProduct, Viterbi, Workspace, WorkspaceOpt};
pub use lattice::{Lattice, NULL_IDX};
pub use model::{CascadeModel, FeatureGenerator, MistakeNorm};
pub use quark::Quark;
pub use sequence::Sequence;
pub use weights::{AveragingWeights, WeightVector, Weights};
