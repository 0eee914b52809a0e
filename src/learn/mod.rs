//! Training-time parameter update strategies. Every rule consumes a scored
//! lattice and increments the weight vector along specific feature paths,
//! returning the number of mistakes on the example for convergence logging.

pub mod perceptron;
pub mod scp;
pub mod stats;

use crate::lattice::viterbi::Workspace;
use crate::lattice::Lattice;
use crate::sequence::Sequence;
use crate::weights::WeightVector;

/// One step of an online learning algorithm, parameterized by the concrete
/// model family it drives.
pub trait UpdateRule<M> {
    /// Updates `w` from one example. `alpha` is the cascade interpolation
    /// parameter; rules that do not train for pruning ignore it.
    fn update_weights(
        &mut self,
        model: &M,
        seq: &Sequence,
        lattice: &Lattice,
        w: &mut dyn WeightVector,
        ws: &mut Workspace,
        alpha: f64,
    ) -> f64;
}
