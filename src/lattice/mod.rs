//! Sparse per-sequence graph of candidate label sequences.
//!
//! Edges are stored as `(left, right)` pairs of linear state indices, where
//! `left` indexes into the states of the previous position and `NULL_IDX`
//! stands for the synthetic boundary node before position 0 or after the
//! last position. Edges "at position p" end to the right of position p-1;
//! the edges at position `length` are the final boundary edges `(x, -1)`.

pub mod viterbi;

use std::io::{Read, Write};

use crate::error::{Error, Result};
use crate::features::{read_feature_vectors, write_feature_vectors, FeatureVector};
use crate::sequence::Sequence;
use crate::wire;

/// Linear state index standing for the boundary node.
pub const NULL_IDX: i32 = -1;

/// Variant discriminant and format version of the general lattice record.
pub const LATTICE_VARIANT: i64 = 0;
pub const LATTICE_VERSION: i64 = 1;
/// Variant discriminant and format version of the edge-free record.
pub const ZERO_ORDER_VARIANT: i64 = 1;
pub const ZERO_ORDER_VERSION: i64 = 4;

/// The per-model piece of lattice construction: which states can precede or
/// follow a given state id between adjacent positions.
pub trait Topology {
    fn previous_states(&self, state: u32) -> Vec<u32>;
    fn next_states(&self, state: u32) -> Vec<u32>;
}

/// One lattice per (sequence, cascade level) pair. Owns all its arrays; a
/// higher-level lattice is built *from* a lower one plus a prune mask but
/// never aliases it. Scores are deliberately absent from this struct except
/// for `carried_scores`, the base-level marginals each state was born from
/// (feature-layer input); inference scratch lives in a
/// [`viterbi::Workspace`] and is never serialized.
#[derive(Debug, Clone, Default)]
pub struct Lattice {
    length: usize,
    pub seq_hash: u32,

    /// Model-defined id (label or encoded label n-gram) per state, in linear
    /// state order. Empty when `uniform_states` is set.
    state_ids: Vec<u32>,
    /// Edge-free lattices where every position carries the same `0..n` state
    /// set may skip storing ids; `state_id` recovers them by arithmetic.
    uniform_states: Option<u32>,
    /// `state_pos_offsets[p]` is the first state index at position `p`;
    /// the last entry is the total state count.
    state_pos_offsets: Vec<u32>,
    /// Same scheme for edges, with one extra slot for the final boundary
    /// edges at position `length`.
    edge_pos_offsets: Vec<u32>,

    /// `[pos][state offset]` -> indices of edges touching the state on the
    /// left/right. This is what keeps forward/backward passes O(edges).
    left_edge_idx: Vec<Vec<Vec<u32>>>,
    right_edge_idx: Vec<Vec<Vec<u32>>>,
    edge_left_state: Vec<i32>,
    edge_right_state: Vec<i32>,

    /// Marginals of the base-level edges/states this lattice was expanded
    /// from, one per state. Empty at the entry level.
    pub carried_scores: Vec<f64>,

    /// Attached feature vectors, one per position / state / edge depending
    /// on the owning model's granularity.
    pub fv_pos: Option<Vec<FeatureVector>>,
    pub fv_state: Option<Vec<FeatureVector>>,
    pub fv_edge: Option<Vec<FeatureVector>>,
}

impl Lattice {
    /// Builds the edge-free entry-level lattice: every label at every
    /// position, no edges. With `store_state_ids` false the ids are kept
    /// implicit (`idx mod num_labels`), which is what the wire format calls
    /// the zero-order variant either way.
    pub fn flat(seq: &Sequence, num_labels: u32, store_state_ids: bool) -> Self {
        let length = seq.len();
        let mut state_pos_offsets = Vec::with_capacity(length + 1);
        state_pos_offsets.push(0);
        for pos in 0..length {
            state_pos_offsets.push((pos as u32 + 1) * num_labels);
        }
        let (state_ids, uniform_states) = if store_state_ids {
            let mut ids = Vec::with_capacity(length * num_labels as usize);
            for _ in 0..length {
                ids.extend(0..num_labels);
            }
            (ids, None)
        } else {
            (Vec::new(), Some(num_labels))
        };
        Self {
            length,
            seq_hash: seq.content_hash(),
            state_ids,
            uniform_states,
            state_pos_offsets,
            edge_pos_offsets: vec![0; length + 2],
            ..Default::default()
        }
    }

    /// Builds a lattice from a prepared state layout, computing all valid
    /// edges under `topo` and then verifying that every state can be reached
    /// from both boundaries. Both failures are fatal: they signal an
    /// upstream modeling bug, not a data error.
    pub fn from_states(
        seq_hash: u32,
        length: usize,
        state_ids: Vec<u32>,
        state_pos_offsets: Vec<u32>,
        carried_scores: Vec<f64>,
        topo: &dyn Topology,
    ) -> Self {
        assert_eq!(state_pos_offsets.len(), length + 1);
        let mut lattice = Self {
            length,
            seq_hash,
            state_ids,
            uniform_states: None,
            state_pos_offsets,
            edge_pos_offsets: vec![0; length + 2],
            carried_scores,
            ..Default::default()
        };
        if lattice.num_states() == 0 {
            panic!("lattice is broken, no states survive\n{}", lattice.dump());
        }
        lattice.compute_valid_edges(topo);
        lattice.check_reachable(topo);
        lattice
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn num_states(&self) -> usize {
        self.state_pos_offsets[self.length] as usize
    }

    pub fn num_edges(&self) -> usize {
        self.edge_pos_offsets[self.length + 1] as usize
    }

    pub fn is_zero_order(&self) -> bool {
        self.num_edges() == 0
    }

    pub fn state_offset(&self, pos: usize) -> usize {
        self.state_pos_offsets[pos] as usize
    }

    pub fn edge_offset(&self, pos: usize) -> usize {
        self.edge_pos_offsets[pos] as usize
    }

    pub fn num_states_at(&self, pos: usize) -> usize {
        self.state_offset(pos + 1) - self.state_offset(pos)
    }

    pub fn num_edges_at(&self, pos: usize) -> usize {
        self.edge_offset(pos + 1) - self.edge_offset(pos)
    }

    pub fn state_id(&self, idx: usize) -> u32 {
        match self.uniform_states {
            Some(n) => (idx % n as usize) as u32,
            None => self.state_ids[idx],
        }
    }

    pub fn left_state(&self, edge_idx: usize) -> i32 {
        self.edge_left_state[edge_idx]
    }

    pub fn right_state(&self, edge_idx: usize) -> i32 {
        self.edge_right_state[edge_idx]
    }

    /// Edges arriving at the state from the left. `state` is the offset of
    /// the state within its position, not a linear index.
    pub fn left_edges(&self, pos: usize, state: usize) -> &[u32] {
        &self.left_edge_idx[pos][state]
    }

    pub fn right_edges(&self, pos: usize, state: usize) -> &[u32] {
        &self.right_edge_idx[pos][state]
    }

    /// Linear index of the state with the given model id at `pos`, or
    /// `NULL_IDX`. Linear scan; positions hold at most a few dozen states.
    pub fn find_state_idx(&self, pos: usize, state: u32) -> i32 {
        for idx in self.state_offset(pos)..self.state_offset(pos + 1) {
            if self.state_id(idx) == state {
                return idx as i32;
            }
        }
        NULL_IDX
    }

    /// Calls `find_state_idx` for all positions along a path of state ids.
    pub fn find_state_path(&self, states: &[u32]) -> Vec<i32> {
        (0..self.length)
            .map(|pos| self.find_state_idx(pos, states[pos]))
            .collect()
    }

    /// Locates the edge between two states by linear index, or `NULL_IDX`.
    /// `pos == length` looks for a final boundary edge from `prev_idx`.
    pub fn find_edge_idx(&self, pos: usize, prev_idx: i32, idx: i32) -> i32 {
        if pos < self.length {
            let rel = idx as usize - self.state_offset(pos);
            for &e in &self.left_edge_idx[pos][rel] {
                if self.edge_left_state[e as usize] == prev_idx {
                    return e as i32;
                }
            }
        } else {
            let rel = prev_idx as usize - self.state_offset(pos - 1);
            for &e in &self.right_edge_idx[pos - 1][rel] {
                if self.edge_right_state[e as usize] == idx {
                    return e as i32;
                }
            }
        }
        NULL_IDX
    }

    /// Converts a path of state ids into its edge-index representation,
    /// starting with the `(-1, state)` entry edge. With `final_edge` the
    /// `(state, -1)` boundary edge is appended, making the result one longer
    /// than the path.
    pub fn find_edge_path(&self, path: &[u32], final_edge: bool) -> Vec<i32> {
        assert_eq!(path.len(), self.length);
        let mut edge_idx = Vec::with_capacity(self.length + final_edge as usize);
        let mut prev_idx = NULL_IDX;
        for (pos, &state) in path.iter().enumerate() {
            let state_idx = self.find_state_idx(pos, state);
            let idx = if state_idx != NULL_IDX {
                self.find_edge_idx(pos, prev_idx, state_idx)
            } else {
                NULL_IDX
            };
            edge_idx.push(idx);
            prev_idx = state_idx;
        }
        if final_edge {
            edge_idx.push(self.find_edge_idx(self.length, prev_idx, NULL_IDX));
        }
        edge_idx
    }

    /// Walks the argmax path backward from the best final-position edge
    /// marginal, following stored forward argmax pointers. Returns edge
    /// indices, including the final boundary edge when `final_edge` is set.
    pub fn argmax_edge_path(
        &self,
        alpha_args: &[i32],
        edge_marginals: &[f64],
        final_edge: bool,
    ) -> Vec<u32> {
        let start = self.edge_offset(self.length);
        let end = self.edge_offset(self.length + 1);
        let mut max = f64::NEG_INFINITY;
        let mut argmax = NULL_IDX;
        for e in start..end {
            if edge_marginals[e] > max {
                max = edge_marginals[e];
                argmax = e as i32;
            }
        }
        if argmax == NULL_IDX {
            panic!("unable to compute argmax over final edges\n{}", self.dump());
        }

        let n = self.length + final_edge as usize;
        let mut path = vec![0u32; n];
        let mut i = n;
        if final_edge {
            i -= 1;
            path[i] = argmax as u32;
        }
        argmax = alpha_args[self.edge_left_state[argmax as usize] as usize];
        while i > 0 {
            i -= 1;
            path[i] = argmax as u32;
            if i > 0 {
                argmax = alpha_args[self.edge_left_state[argmax as usize] as usize];
            }
        }
        path
    }

    /// State ids along the argmax path.
    pub fn argmax_states(&self, alpha_args: &[i32], edge_marginals: &[f64]) -> Vec<u32> {
        self.argmax_edge_path(alpha_args, edge_marginals, false)
            .into_iter()
            .map(|e| self.state_id(self.edge_right_state[e as usize] as usize))
            .collect()
    }

    /// Per-position mean and max over state scores. Output slices must hold
    /// `length` entries.
    pub fn per_position_state_mean_max(&self, scores: &[f64], mean: &mut [f64], max: &mut [f64]) {
        for pos in 0..self.length {
            let start = self.state_offset(pos);
            let end = self.state_offset(pos + 1);
            let mut mn = 0.0;
            let mut mx = f64::NEG_INFINITY;
            for idx in start..end {
                mn += scores[idx];
                if scores[idx] > mx {
                    mx = scores[idx];
                }
            }
            mean[pos] = mn / (end - start) as f64;
            max[pos] = mx;
        }
    }

    /// Mean and max over all edge scores.
    pub fn edge_mean_max(&self, scores: &[f64]) -> (f64, f64) {
        let n = self.num_edges();
        let mut mean = 0.0;
        let mut max = f64::NEG_INFINITY;
        for &v in &scores[..n] {
            mean += v;
            if v > max {
                max = v;
            }
        }
        (mean / n as f64, max)
    }

    /// Counts how many max-marginal witness paths pass through each edge.
    ///
    /// The witness path of an edge is the edge itself plus the chain of
    /// forward argmax pointers walked back from its left endpoint and the
    /// chain of backward argmax pointers walked forward from its right
    /// endpoint. Rather than re-walking each chain per edge, both chain
    /// families form forests (`parent(e) = alpha_args[left(e)]` and
    /// `parent(e) = beta_args[right(e)]`), so a single descending and a
    /// single ascending pass over positions accumulate the descendant counts
    /// with bounded stack usage.
    pub fn edge_witnesses(&self, alpha_args: &[i32], beta_args: &[i32], witness: &mut [u32]) {
        let n = self.num_edges();
        let mut back = vec![0u32; n];
        let mut fwd = vec![0u32; n];

        for pos in (1..=self.length).rev() {
            for e in self.edge_offset(pos)..self.edge_offset(pos + 1) {
                let left = self.edge_left_state[e];
                if left != NULL_IDX {
                    let parent = alpha_args[left as usize] as usize;
                    back[parent] += 1 + back[e];
                }
            }
        }
        for pos in 0..self.length {
            for e in self.edge_offset(pos)..self.edge_offset(pos + 1) {
                let right = self.edge_right_state[e];
                if right != NULL_IDX {
                    let parent = beta_args[right as usize] as usize;
                    fwd[parent] += 1 + fwd[e];
                }
            }
        }
        for e in 0..n {
            witness[e] = 1 + back[e] + fwd[e];
        }
    }

    /// Position of the state linearly indexed by `idx`.
    pub fn find_state_pos(&self, idx: usize) -> usize {
        assert!(
            idx < self.num_states(),
            "index {} is outside the range of states for this lattice",
            idx
        );
        let mut pos = 0;
        while idx >= self.state_pos_offsets[pos + 1] as usize {
            pos += 1;
        }
        pos
    }

    /// Position of the edge linearly indexed by `idx` (see `find_state_pos`).
    pub fn find_edge_pos(&self, idx: usize) -> usize {
        assert!(
            idx < self.num_edges(),
            "index {} is outside the range of edges for this lattice",
            idx
        );
        let mut pos = 0;
        while idx >= self.edge_pos_offsets[pos + 1] as usize {
            pos += 1;
        }
        pos
    }

    // ------------------------------------------------------------------
    // construction internals

    fn add_edge(&mut self, left: i32, right: i32) -> u32 {
        self.edge_left_state.push(left);
        self.edge_right_state.push(right);
        (self.edge_left_state.len() - 1) as u32
    }

    /// Given the sparse state layout, computes all valid edges under the
    /// model topology. Left edges are created first; the right pass only
    /// locates them (plus the final boundary edges, which are appended last
    /// so they form the block at position `length`).
    fn compute_valid_edges(&mut self, topo: &dyn Topology) {
        self.left_edge_idx = Vec::with_capacity(self.length);
        self.right_edge_idx = Vec::with_capacity(self.length);
        for pos in 0..self.length {
            let n = self.num_states_at(pos);
            self.left_edge_idx.push(vec![Vec::new(); n]);
            self.right_edge_idx.push(vec![Vec::new(); n]);
        }

        for pos in 0..self.length {
            for i in 0..self.num_states_at(pos) {
                let idx = self.state_offset(pos) + i;
                if pos == 0 {
                    let e = self.add_edge(NULL_IDX, idx as i32);
                    self.left_edge_idx[pos][i].push(e);
                } else {
                    for prev in topo.previous_states(self.state_id(idx)) {
                        let prev_idx = self.find_state_idx(pos - 1, prev);
                        if prev_idx != NULL_IDX {
                            let e = self.add_edge(prev_idx, idx as i32);
                            self.left_edge_idx[pos][i].push(e);
                        }
                    }
                }
            }
            self.edge_pos_offsets[pos + 1] = self.edge_left_state.len() as u32;
        }

        for pos in 0..self.length {
            for i in 0..self.num_states_at(pos) {
                let idx = self.state_offset(pos) + i;
                if pos == self.length - 1 {
                    let e = self.add_edge(idx as i32, NULL_IDX);
                    self.right_edge_idx[pos][i].push(e);
                } else {
                    for next in topo.next_states(self.state_id(idx)) {
                        let next_idx = self.find_state_idx(pos + 1, next);
                        if next_idx != NULL_IDX {
                            let e = self.find_edge_idx(pos + 1, idx as i32, next_idx);
                            debug_assert_ne!(e, NULL_IDX);
                            self.right_edge_idx[pos][i].push(e as u32);
                        }
                    }
                }
            }
        }
        self.edge_pos_offsets[self.length + 1] = self.edge_left_state.len() as u32;
    }

    /// Every state at an interior position must lie on at least one
    /// boundary-to-boundary path. An unreachable state means the expansion
    /// or the topology is inconsistent; construction never silently drops it.
    fn check_reachable(&self, topo: &dyn Topology) {
        let fwd = self.reachable_forward(topo);
        let bwd = self.reachable_backward(topo);
        for pos in 0..self.length {
            for idx in self.state_offset(pos)..self.state_offset(pos + 1) {
                if !fwd[idx] || !bwd[idx] {
                    panic!(
                        "position {} state {} = unreachable state detected\n{}",
                        pos,
                        idx,
                        self.dump()
                    );
                }
            }
        }
    }

    fn reachable_forward(&self, topo: &dyn Topology) -> Vec<bool> {
        let mut reachable = vec![false; self.num_states()];
        if self.length == 1 {
            reachable.iter_mut().for_each(|r| *r = true);
            return reachable;
        }
        for pos in 0..self.length - 1 {
            for idx in self.state_offset(pos)..self.state_offset(pos + 1) {
                if pos == 0 {
                    reachable[idx] = true;
                }
                if reachable[idx] {
                    for next in topo.next_states(self.state_id(idx)) {
                        let next_idx = self.find_state_idx(pos + 1, next);
                        if next_idx != NULL_IDX {
                            reachable[next_idx as usize] = true;
                        }
                    }
                }
            }
        }
        reachable
    }

    fn reachable_backward(&self, topo: &dyn Topology) -> Vec<bool> {
        let mut reachable = vec![false; self.num_states()];
        if self.length == 1 {
            reachable.iter_mut().for_each(|r| *r = true);
            return reachable;
        }
        for pos in (1..self.length).rev() {
            let mut any_reachable = false;
            for idx in self.state_offset(pos)..self.state_offset(pos + 1) {
                if pos == self.length - 1 {
                    reachable[idx] = true;
                }
                if reachable[idx] {
                    for prev in topo.previous_states(self.state_id(idx)) {
                        let prev_idx = self.find_state_idx(pos - 1, prev);
                        if prev_idx != NULL_IDX {
                            reachable[prev_idx as usize] = true;
                            any_reachable = true;
                        }
                    }
                }
            }
            if !any_reachable {
                panic!(
                    "lattice (hash {:#x}) broken at position {}\n{}",
                    self.seq_hash,
                    pos,
                    self.dump()
                );
            }
        }
        reachable
    }

    // ------------------------------------------------------------------
    // diagnostics

    /// Full structural dump for postmortems.
    pub fn dump(&self) -> String {
        use std::fmt::Write as _;
        let mut s = String::new();
        let _ = writeln!(s, "lattice dump: length {}", self.length);
        let _ = writeln!(s, "state offsets: {:?}", self.state_pos_offsets);
        let _ = writeln!(s, "edge offsets: {:?}", self.edge_pos_offsets);
        for pos in 0..self.length {
            let _ = writeln!(s, "states at position {}:", pos);
            for idx in self.state_offset(pos)..self.state_offset(pos + 1) {
                let _ = writeln!(s, "  [{}]: state {}", idx, self.state_id(idx));
            }
        }
        for pos in 0..=self.length.min(self.edge_pos_offsets.len().saturating_sub(2)) {
            for e in self.edge_offset(pos)..self.edge_offset(pos + 1) {
                let _ = writeln!(
                    s,
                    "pos {}: [{}] ({},{})",
                    pos, e, self.edge_left_state[e], self.edge_right_state[e]
                );
            }
        }
        s
    }

    /// Lists every edge with its score, flagging the ones a mask would
    /// prune. Used when aborting on an all-pruned position.
    pub fn dump_edge_mask(&self, scores: &[f64], mask: &[bool]) -> String {
        use std::fmt::Write as _;
        let mut s = String::new();
        for pos in 0..=self.length {
            for e in self.edge_offset(pos)..self.edge_offset(pos + 1) {
                let _ = writeln!(
                    s,
                    "{}:[{}] ({},{}) = {:e}{}",
                    pos,
                    e,
                    self.edge_left_state[e],
                    self.edge_right_state[e],
                    scores[e],
                    if mask[e] { "" } else { " XXX" }
                );
            }
        }
        s
    }

    // ------------------------------------------------------------------
    // serialization

    /// Writes the tagged binary record. Scores are never saved; they are
    /// always recomputed after a read.
    pub fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        if self.is_zero_order() {
            wire::write_i64(w, ZERO_ORDER_VARIANT)?;
            wire::write_i64(w, ZERO_ORDER_VERSION)?;
            wire::write_u32(w, self.seq_hash)?;
            wire::write_u32(w, self.length as u32)?;
            wire::write_u32(w, self.uniform_states.unwrap_or(0))?;
            wire::write_bool(w, self.uniform_states.is_none())?;
            wire::write_u32_array(w, &self.state_pos_offsets)?;
            if self.uniform_states.is_none() {
                wire::write_u32_array(w, &self.state_ids)?;
            }
            write_feature_vectors(w, &self.fv_pos)?;
            write_feature_vectors(w, &self.fv_state)?;
        } else {
            wire::write_i64(w, LATTICE_VARIANT)?;
            wire::write_i64(w, LATTICE_VERSION)?;
            wire::write_u32(w, self.seq_hash)?;
            wire::write_u32(w, self.length as u32)?;
            wire::write_u32_array(w, &self.state_ids)?;
            wire::write_u32_array(w, &self.state_pos_offsets)?;
            wire::write_u32_array(w, &self.edge_pos_offsets)?;
            wire::write_adjacency(w, &self.left_edge_idx)?;
            wire::write_adjacency(w, &self.right_edge_idx)?;
            wire::write_i32_array(w, &self.edge_left_state)?;
            wire::write_i32_array(w, &self.edge_right_state)?;
            write_feature_vectors(w, &self.fv_pos)?;
            write_feature_vectors(w, &self.fv_state)?;
            write_feature_vectors(w, &self.fv_edge)?;
        }
        Ok(())
    }

    /// Reads whichever lattice variant follows in the stream.
    pub fn read<R: Read>(r: &mut R) -> Result<Self> {
        let variant = wire::read_i64(r)?;
        match variant {
            LATTICE_VARIANT => Self::read_general(r),
            ZERO_ORDER_VARIANT => Self::read_zero_order(r),
            other => Err(Error::UnknownVariant(other)),
        }
    }

    fn read_general<R: Read>(r: &mut R) -> Result<Self> {
        wire::expect_version(r, LATTICE_VERSION)?;
        let seq_hash = wire::read_u32(r)?;
        let length = wire::read_u32(r)? as usize;
        let state_ids = wire::read_u32_array(r)?;
        let state_pos_offsets = wire::read_u32_array(r)?;
        let edge_pos_offsets = wire::read_u32_array(r)?;
        let left_edge_idx = wire::read_adjacency(r)?;
        let right_edge_idx = wire::read_adjacency(r)?;
        let edge_left_state = wire::read_i32_array(r)?;
        let edge_right_state = wire::read_i32_array(r)?;
        let fv_pos = read_feature_vectors(r)?;
        let fv_state = read_feature_vectors(r)?;
        let fv_edge = read_feature_vectors(r)?;
        Ok(Self {
            length,
            seq_hash,
            state_ids,
            uniform_states: None,
            state_pos_offsets,
            edge_pos_offsets,
            left_edge_idx,
            right_edge_idx,
            edge_left_state,
            edge_right_state,
            carried_scores: Vec::new(),
            fv_pos,
            fv_state,
            fv_edge,
        })
    }

    fn read_zero_order<R: Read>(r: &mut R) -> Result<Self> {
        wire::expect_version(r, ZERO_ORDER_VERSION)?;
        let seq_hash = wire::read_u32(r)?;
        let length = wire::read_u32(r)? as usize;
        let n_states = wire::read_u32(r)?;
        let store_ids = wire::read_bool(r)?;
        let state_pos_offsets = wire::read_u32_array(r)?;
        let state_ids = if store_ids {
            wire::read_u32_array(r)?
        } else {
            Vec::new()
        };
        let fv_pos = read_feature_vectors(r)?;
        let fv_state = read_feature_vectors(r)?;
        Ok(Self {
            length,
            seq_hash,
            state_ids,
            uniform_states: if store_ids { None } else { Some(n_states) },
            state_pos_offsets,
            edge_pos_offsets: vec![0; length + 2],
            carried_scores: Vec::new(),
            fv_pos,
            fv_state,
            ..Default::default()
        })
    }
}
