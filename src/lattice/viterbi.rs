//! Interchangeable dynamic-programming strategies over a scored lattice:
//! max-sum (best path) and sum-product (exact marginals via log-domain
//! summation).
//!
//! Both operate on edge scores alone; the owning model folds each state's
//! score into the scores of its incoming edges, so no pass ever reads a
//! separate state-score buffer.

use bitflags::bitflags;

use super::{Lattice, NULL_IDX};

bitflags! {
    /// Which scratch buffers a [`Workspace`] maintains.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WorkspaceOpt: u32 {
        /// Argmax pointers for path extraction and witness counting.
        const VITERBI = 0x01;
        /// Edge marginal and witness buffers.
        const MARGINALS = 0x02;
    }
}

/// Reusable scratch buffers for inference over one lattice at a time.
///
/// Buffers are sized to the largest lattice seen so far and grown on demand,
/// never reallocated from scratch per call. One workspace per worker; passing
/// it explicitly keeps unrelated inference calls from coupling through
/// hidden model state.
#[derive(Debug)]
pub struct Workspace {
    opt: WorkspaceOpt,
    cap_states: usize,
    cap_edges: usize,

    pub state_scores: Vec<f64>,
    pub edge_scores: Vec<f64>,
    pub alpha_vals: Vec<f64>,
    pub beta_vals: Vec<f64>,
    pub alpha_args: Vec<i32>,
    pub beta_args: Vec<i32>,
    pub marginals: Vec<f64>,
    pub witness: Vec<u32>,
    pub mask: Vec<bool>,
    /// Per-position scratch for the flat models' thresholds.
    pub pos_mean: Vec<f64>,
    pub pos_max: Vec<f64>,

    /// Mean/max over the marginals of the last scored lattice.
    pub mean_edge_score: f64,
    pub max_edge_score: f64,
}

impl Workspace {
    pub fn new(opt: WorkspaceOpt) -> Self {
        Self {
            opt,
            cap_states: 0,
            cap_edges: 0,
            state_scores: Vec::new(),
            edge_scores: Vec::new(),
            alpha_vals: Vec::new(),
            beta_vals: Vec::new(),
            alpha_args: Vec::new(),
            beta_args: Vec::new(),
            marginals: Vec::new(),
            witness: Vec::new(),
            mask: Vec::new(),
            pos_mean: Vec::new(),
            pos_max: Vec::new(),
            mean_edge_score: f64::NAN,
            max_edge_score: f64::NAN,
        }
    }

    /// Grows every buffer to cover `lattice` and clears the accumulating
    /// ones (scores are filled with `+=`, witness counts with `+`).
    pub fn prepare(&mut self, lattice: &Lattice) {
        let n_states = lattice.num_states();
        let n_edges = lattice.num_edges();
        let length = lattice.length();

        if self.cap_states < n_states {
            self.state_scores.resize(n_states, 0.0);
            self.alpha_vals.resize(n_states, 0.0);
            self.beta_vals.resize(n_states, 0.0);
            if self.opt.contains(WorkspaceOpt::VITERBI) {
                self.alpha_args.resize(n_states, 0);
                self.beta_args.resize(n_states, 0);
            }
            self.mask.resize(self.mask.len().max(n_states), true);
            self.cap_states = n_states;
        }
        if self.cap_edges < n_edges {
            self.edge_scores.resize(n_edges, 0.0);
            if self.opt.contains(WorkspaceOpt::MARGINALS) {
                self.marginals.resize(n_edges, 0.0);
                self.witness.resize(n_edges, 0);
            }
            self.mask.resize(self.mask.len().max(n_edges), true);
            self.cap_edges = n_edges;
        }
        if self.pos_mean.len() < length {
            self.pos_mean.resize(length, 0.0);
            self.pos_max.resize(length, 0.0);
        }

        for v in self.state_scores[..n_states].iter_mut() {
            *v = 0.0;
        }
        for v in self.edge_scores[..n_edges].iter_mut() {
            *v = 0.0;
        }
        if self.opt.contains(WorkspaceOpt::MARGINALS) {
            for v in self.witness[..n_edges].iter_mut() {
                *v = 0;
            }
        }
        self.mean_edge_score = f64::NAN;
        self.max_edge_score = f64::NAN;
    }
}

impl Default for Workspace {
    fn default() -> Self {
        Self::new(WorkspaceOpt::VITERBI | WorkspaceOpt::MARGINALS)
    }
}

/// Numerically stable `log(exp(a) + exp(b))`. Piecewise so the exponent is
/// always non-positive.
#[inline]
pub fn logsumexp(a: f64, b: f64) -> f64 {
    if a > b {
        a + (b - a).exp().ln_1p()
    } else {
        b + (a - b).exp().ln_1p()
    }
}

/// A forward-backward strategy over a lattice with precomputed edge scores.
pub trait Viterbi {
    /// Forward pass. `alpha_vals[idx]` summarizes all paths from the start
    /// boundary into state `idx`; `alpha_args[idx]` records the best
    /// incoming edge where the strategy tracks one.
    fn compute_alpha(
        &self,
        lattice: &Lattice,
        edge_scores: &[f64],
        alpha_vals: &mut [f64],
        alpha_args: &mut [i32],
    );

    /// Backward pass, symmetric from the right.
    fn compute_beta(
        &self,
        lattice: &Lattice,
        edge_scores: &[f64],
        beta_vals: &mut [f64],
        beta_args: &mut [i32],
    );

    /// Per-edge marginals from the two passes. Max-sum yields raw path
    /// scores; sum-product yields normalized probabilities.
    fn compute_edge_marginals(
        &self,
        lattice: &Lattice,
        edge_scores: &[f64],
        alpha_vals: &[f64],
        beta_vals: &[f64],
        marginals: &mut [f64],
    );
}

/// Max-sum: recovers the single best path. Ties break on strict `>`, so the
/// first-seen maximum wins when scores are exactly equal.
#[derive(Debug, Default)]
pub struct MaxSum;

impl Viterbi for MaxSum {
    fn compute_alpha(
        &self,
        lattice: &Lattice,
        edge_scores: &[f64],
        alpha_vals: &mut [f64],
        alpha_args: &mut [i32],
    ) {
        for pos in 0..lattice.length() {
            let start = lattice.state_offset(pos);
            let end = lattice.state_offset(pos + 1);
            for idx in start..end {
                let mut max = f64::NEG_INFINITY;
                let mut argmax = NULL_IDX;
                for &e in lattice.left_edges(pos, idx - start) {
                    let left = lattice.left_state(e as usize);
                    let mut val = edge_scores[e as usize];
                    if left != NULL_IDX {
                        val += alpha_vals[left as usize];
                    }
                    if val > max {
                        max = val;
                        argmax = e as i32;
                    }
                }
                if argmax == NULL_IDX {
                    panic!("computing alpha failed: invalid argmax at state {}", idx);
                }
                alpha_vals[idx] = max;
                alpha_args[idx] = argmax;
            }
        }
    }

    fn compute_beta(
        &self,
        lattice: &Lattice,
        edge_scores: &[f64],
        beta_vals: &mut [f64],
        beta_args: &mut [i32],
    ) {
        for pos in (0..lattice.length()).rev() {
            let start = lattice.state_offset(pos);
            let end = lattice.state_offset(pos + 1);
            for idx in start..end {
                let mut max = f64::NEG_INFINITY;
                let mut argmax = NULL_IDX;
                for &e in lattice.right_edges(pos, idx - start) {
                    let right = lattice.right_state(e as usize);
                    let mut val = edge_scores[e as usize];
                    if right != NULL_IDX {
                        val += beta_vals[right as usize];
                    }
                    if val > max {
                        max = val;
                        argmax = e as i32;
                    }
                }
                if argmax == NULL_IDX {
                    panic!("computing beta failed: invalid argmax at state {}", idx);
                }
                beta_vals[idx] = max;
                beta_args[idx] = argmax;
            }
        }
    }

    fn compute_edge_marginals(
        &self,
        lattice: &Lattice,
        edge_scores: &[f64],
        alpha_vals: &[f64],
        beta_vals: &[f64],
        marginals: &mut [f64],
    ) {
        for e in 0..lattice.num_edges() {
            let left = lattice.left_state(e);
            let right = lattice.right_state(e);
            let mut val = edge_scores[e];
            if left != NULL_IDX {
                val += alpha_vals[left as usize];
            }
            if right != NULL_IDX {
                val += beta_vals[right as usize];
            }
            marginals[e] = val;
        }
    }
}

/// Sum-product: the same recursion with `logsumexp` in place of `max`.
/// Argmax buffers are left untouched.
#[derive(Debug, Default)]
pub struct SumProduct;

impl SumProduct {
    /// Log partition function: log-sum over the final position's states.
    pub fn log_partition(lattice: &Lattice, alpha_vals: &[f64]) -> f64 {
        let start = lattice.state_offset(lattice.length() - 1);
        let end = lattice.state_offset(lattice.length());
        let mut logz = alpha_vals[start];
        for idx in start + 1..end {
            logz = logsumexp(logz, alpha_vals[idx]);
        }
        logz
    }
}

impl Viterbi for SumProduct {
    fn compute_alpha(
        &self,
        lattice: &Lattice,
        edge_scores: &[f64],
        alpha_vals: &mut [f64],
        _alpha_args: &mut [i32],
    ) {
        for pos in 0..lattice.length() {
            let start = lattice.state_offset(pos);
            let end = lattice.state_offset(pos + 1);
            for idx in start..end {
                // the first incoming edge seeds the sum; scores are
                // log-domain, so no sentinel value is safe to start from
                let mut sum: Option<f64> = None;
                for &e in lattice.left_edges(pos, idx - start) {
                    let left = lattice.left_state(e as usize);
                    let mut val = edge_scores[e as usize];
                    if left != NULL_IDX {
                        val += alpha_vals[left as usize];
                    }
                    sum = Some(match sum {
                        None => val,
                        Some(s) => logsumexp(s, val),
                    });
                }
                alpha_vals[idx] = match sum {
                    Some(s) => s,
                    None => panic!("computing alpha failed: state {} has no incoming edges", idx),
                };
            }
        }
    }

    fn compute_beta(
        &self,
        lattice: &Lattice,
        edge_scores: &[f64],
        beta_vals: &mut [f64],
        _beta_args: &mut [i32],
    ) {
        for pos in (0..lattice.length()).rev() {
            let start = lattice.state_offset(pos);
            let end = lattice.state_offset(pos + 1);
            for idx in start..end {
                let mut sum: Option<f64> = None;
                for &e in lattice.right_edges(pos, idx - start) {
                    let right = lattice.right_state(e as usize);
                    let mut val = edge_scores[e as usize];
                    if right != NULL_IDX {
                        val += beta_vals[right as usize];
                    }
                    sum = Some(match sum {
                        None => val,
                        Some(s) => logsumexp(s, val),
                    });
                }
                beta_vals[idx] = match sum {
                    Some(s) => s,
                    None => panic!("computing beta failed: state {} has no outgoing edges", idx),
                };
            }
        }
    }

    fn compute_edge_marginals(
        &self,
        lattice: &Lattice,
        edge_scores: &[f64],
        alpha_vals: &[f64],
        beta_vals: &[f64],
        marginals: &mut [f64],
    ) {
        let logz = Self::log_partition(lattice, alpha_vals);
        for e in 0..lattice.num_edges() {
            let left = lattice.left_state(e);
            let right = lattice.right_state(e);
            let mut val = edge_scores[e];
            if left != NULL_IDX {
                val += alpha_vals[left as usize];
            }
            if right != NULL_IDX {
                val += beta_vals[right as usize];
            }
            marginals[e] = (val - logz).exp();
        }
    }
}
