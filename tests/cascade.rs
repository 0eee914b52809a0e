//! End-to-end tests over the public API: building the entry lattice,
//! expanding through cascade levels, training each level, and decoding.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use seqcascade::learn::perceptron::{FlatPerceptron, NgramPerceptron};
use seqcascade::learn::scp::NgramCascade;
use seqcascade::learn::UpdateRule;
use seqcascade::model::flat::{FlatConfig, FlatModel};
use seqcascade::model::ngram::{NgramConfig, NgramModel};
use seqcascade::model::label_alphabet;
use seqcascade::{
    AveragingWeights, CascadeModel, FeatureGenerator, FeatureVector, Lattice, MaxSum, Quark,
    Sequence, SumProduct, Weights, Workspace, NULL_IDX,
};

/// Feature names observed by the generator, so tests can address weights by
/// name after lattices have been built.
#[derive(Clone, Default)]
struct Names(Rc<RefCell<HashMap<String, u32>>>);

impl Names {
    fn id(&self, name: &str) -> u32 {
        *self
            .0
            .borrow()
            .get(name)
            .unwrap_or_else(|| panic!("feature {} was never generated", name))
    }
}

/// Emits one indicator per surface form and one per transition between the
/// current labels of adjacent states.
struct ToyFeatures {
    radix: u32,
    names: Names,
}

impl ToyFeatures {
    fn new(labels: &Quark, names: Names) -> Self {
        Self {
            radix: labels.len() as u32,
            names,
        }
    }

    fn intern(&mut self, key: String, alphabet: &mut Quark) -> FeatureVector {
        match alphabet.find_or_insert(&key) {
            Some(id) => {
                self.names.0.borrow_mut().insert(key, id);
                FeatureVector::binary(vec![id])
            }
            None => FeatureVector::default(),
        }
    }

    fn current_label(&self, state: u32, order: usize) -> u32 {
        state / self.radix.pow(order as u32 - 1)
    }
}

impl FeatureGenerator for ToyFeatures {
    fn position_features(
        &mut self,
        seq: &Sequence,
        pos: usize,
        alphabet: &mut Quark,
    ) -> FeatureVector {
        let key = format!("w={}", seq.forms[pos]);
        self.intern(key, alphabet)
    }

    fn state_features(
        &mut self,
        _seq: &Sequence,
        _pos: usize,
        _state: u32,
        _order: usize,
        _alphabet: &mut Quark,
    ) -> FeatureVector {
        FeatureVector::default()
    }

    fn edge_features(
        &mut self,
        _seq: &Sequence,
        _pos: usize,
        prev_state: u32,
        state: u32,
        order: usize,
        alphabet: &mut Quark,
    ) -> FeatureVector {
        let prev = self.current_label(prev_state, order);
        let cur = self.current_label(state, order);
        let key = format!("t:{}>{}", prev, cur);
        self.intern(key, alphabet)
    }
}

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn seq(id: u32, forms: &[&str], labels: &[u32]) -> Sequence {
    Sequence::new(
        id,
        forms.iter().map(|s| s.to_string()).collect(),
        labels.to_vec(),
    )
}

/// The concrete scenario: length-3 sequence, labels {A, B}, order-1 model.
/// Transition scores A>A=2, B>B=1, others 0; best path must be [A, A, A]
/// with total score 4.
#[test]
fn order_one_decoding_matches_hand_computation() {
    let labels = Arc::new(label_alphabet(["A", "B"].iter()));
    let names = Names::default();
    let mut model = NgramModel::new(
        NgramConfig {
            order: 1,
            use_position_features: false,
            ..Default::default()
        },
        labels.clone(),
        Box::new(ToyFeatures::new(&labels, names.clone())),
        Box::new(MaxSum),
    );

    let s = seq(0, &["x", "y", "z"], &[0, 0, 0]);
    let base = Lattice::flat(&s, 2, true);
    let all = vec![true; base.num_states()];
    let carried = vec![0.0; base.num_states()];
    let lattice = model.expand_lattice(&s, &base, &carried, &all);

    // 2 states at each of the 3 positions
    assert_eq!(lattice.num_states(), 6);
    for pos in 0..3 {
        assert_eq!(lattice.num_states_at(pos), 2);
    }
    // 2 entry + 4 + 4 + 2 final boundary edges
    assert_eq!(lattice.num_edges(), 12);
    assert_eq!(lattice.num_edges_at(0), 2);
    assert_eq!(lattice.num_edges_at(1), 4);
    assert_eq!(lattice.num_edges_at(2), 4);
    assert_eq!(lattice.num_edges_at(3), 2);

    let mut w = Weights::new(model.num_features());
    w.w[names.id("t:0>0") as usize] = 2.0;
    w.w[names.id("t:1>1") as usize] = 1.0;

    let mut ws = Workspace::default();
    model.compute_edge_marginals(&w, &s, &lattice, &mut ws, false);

    assert_eq!(model.compute_guesses(&lattice, &ws), vec![0, 0, 0]);

    // best final-edge marginal is the full path score
    let best = (lattice.edge_offset(3)..lattice.edge_offset(4))
        .map(|e| ws.marginals[e])
        .fold(f64::NEG_INFINITY, f64::max);
    assert!((best - 4.0).abs() < 1e-12);
}

#[test]
fn sum_product_marginals_are_probabilities() {
    let labels = Arc::new(label_alphabet(["A", "B"].iter()));
    let names = Names::default();
    let mut model = NgramModel::new(
        NgramConfig {
            order: 1,
            use_position_features: false,
            ..Default::default()
        },
        labels.clone(),
        Box::new(ToyFeatures::new(&labels, names.clone())),
        Box::new(SumProduct),
    );

    let s = seq(0, &["x", "y", "z"], &[0, 1, 0]);
    let base = Lattice::flat(&s, 2, true);
    let all = vec![true; base.num_states()];
    let carried = vec![0.0; base.num_states()];
    let lattice = model.expand_lattice(&s, &base, &carried, &all);

    let mut w = Weights::new(model.num_features());
    w.w[names.id("t:0>0") as usize] = 0.7;
    w.w[names.id("t:0>1") as usize] = -0.3;
    w.w[names.id("t:1>0") as usize] = 0.2;

    let mut ws = Workspace::default();
    model.compute_edge_marginals(&w, &s, &lattice, &mut ws, false);

    for pos in 0..=lattice.length() {
        let sum: f64 = (lattice.edge_offset(pos)..lattice.edge_offset(pos + 1))
            .map(|e| ws.marginals[e])
            .sum();
        assert!((sum - 1.0).abs() < 1e-9, "position {}: {}", pos, sum);
    }
}

fn toy_corpus() -> Vec<Sequence> {
    // D=0, N=1, V=2
    vec![
        seq(0, &["the", "dog", "runs"], &[0, 1, 2]),
        seq(1, &["the", "cat", "sleeps"], &[0, 1, 2]),
    ]
}

/// Trains the full two-level cascade on a separable toy corpus and checks
/// that pruning never loses the truth and decoding recovers it.
#[test]
fn cascade_trains_prunes_and_decodes() {
    init_logs();
    let labels = Arc::new(label_alphabet(["D", "N", "V"].iter()));
    let train = toy_corpus();

    // ------------------------------------------------------- level 0: flat
    let names0 = Names::default();
    let mut flat = FlatModel::new(
        FlatConfig::default(),
        labels.clone(),
        Box::new(ToyFeatures::new(&labels, names0)),
    );
    flat.precompute_features(&train);

    let lattices: Vec<Lattice> = train.iter().map(|s| flat.create_lattice(s)).collect();

    let mut w0 = AveragingWeights::new(flat.num_features());
    let mut ws = Workspace::default();
    let mut rule0 = FlatPerceptron::default();
    for _ in 0..10 {
        w0.next_iteration();
        for (s, l) in train.iter().zip(&lattices) {
            rule0.update_weights(&flat, s, l, &mut w0, &mut ws, 0.5);
        }
    }
    let w0 = w0.copy_averaged();

    // ---------------------------------------------- level 1: order-1 model
    let names1 = Names::default();
    let mut order1 = NgramModel::new(
        NgramConfig {
            order: 1,
            ..Default::default()
        },
        labels.clone(),
        Box::new(ToyFeatures::new(&labels, names1)),
        Box::new(MaxSum),
    );
    order1.precompute_features(&train);

    let mut level1 = Vec::new();
    for (s, l) in train.iter().zip(&lattices) {
        flat.compute_filter_mask(&w0, s, l, &mut ws, 0.5, true);
        // the truth may never be filtered from its own training signal
        for (pos, &idx) in l.find_state_path(&s.labels).iter().enumerate() {
            assert!(ws.mask[idx as usize], "truth pruned at position {}", pos);
        }
        let (marginals, mask) = (ws.state_scores.clone(), ws.mask.clone());
        level1.push(order1.expand_lattice(s, l, &marginals, &mask));
    }

    let mut w1 = AveragingWeights::new(order1.num_features());
    let mut rule1 = NgramPerceptron::default();
    for _ in 0..10 {
        w1.next_iteration();
        for (s, l) in train.iter().zip(&level1) {
            rule1.update_weights(&order1, s, l, &mut w1, &mut ws, 0.5);
        }
    }
    let w1 = w1.copy_averaged();

    for (s, l) in train.iter().zip(&level1) {
        order1.compute_edge_marginals(&w1, s, l, &mut ws, false);
        assert_eq!(order1.compute_guesses(l, &ws), s.labels, "decode {}", s.id);
    }

    // ---------------------------------------------- level 2: order-2 model
    let names2 = Names::default();
    let mut order2 = NgramModel::new(
        NgramConfig {
            order: 2,
            use_position_features: false,
            ..Default::default()
        },
        labels.clone(),
        Box::new(ToyFeatures::new(&labels, names2)),
        Box::new(MaxSum),
    );

    for (s, l) in train.iter().zip(&level1) {
        order1.compute_filter_mask(&w1, s, l, &mut ws, 0.5, true);
        for &e in &l.find_edge_path(&order1.truth_states(s), true) {
            assert_ne!(e, NULL_IDX);
            assert!(ws.mask[e as usize], "truth edge {} pruned", e);
        }
        let (marginals, mask) = (ws.marginals.clone(), ws.mask.clone());
        let l2 = order2.expand_lattice(s, l, &marginals, &mask);

        // the gold trigram path must exist in the expanded lattice
        for (pos, &idx) in l2
            .find_state_path(&order2.truth_states(s))
            .iter()
            .enumerate()
        {
            assert_ne!(idx, NULL_IDX, "truth state missing at position {}", pos);
        }
        // pruning paid off: strictly fewer states than the unpruned bound
        assert!(l2.num_states() <= l.num_edges());
    }
}

/// On separable data the cascade subgradient hinge must eventually clear:
/// the truth path outgrows the blended threshold by the length margin and
/// the update stops firing.
#[test]
fn cascade_update_reaches_the_margin() {
    init_logs();
    let labels = Arc::new(label_alphabet(["D", "N", "V"].iter()));
    let train = toy_corpus();

    let names = Names::default();
    let mut model = NgramModel::new(
        NgramConfig {
            order: 1,
            use_position_features: true,
            ..Default::default()
        },
        labels.clone(),
        Box::new(ToyFeatures::new(&labels, names)),
        Box::new(MaxSum),
    );
    model.precompute_features(&train);

    let mut lattices = Vec::new();
    for s in &train {
        let base = Lattice::flat(s, 3, false);
        let all = vec![true; base.num_states()];
        let carried = vec![0.0; base.num_states()];
        lattices.push(model.expand_lattice(s, &base, &carried, &all));
    }

    let mut w = AveragingWeights::new(model.num_features());
    let mut ws = Workspace::default();
    let mut rule = NgramCascade::default();

    let mut converged = false;
    for _ in 0..200 {
        w.next_iteration();
        let mut mistakes = 0.0;
        for (s, l) in train.iter().zip(&lattices) {
            mistakes += rule.update_weights(&model, s, l, &mut w, &mut ws, 0.5);
        }
        if mistakes == 0.0 {
            converged = true;
            break;
        }
    }
    assert!(converged, "margin never reached on separable data");

    for (s, l) in train.iter().zip(&lattices) {
        model.compute_edge_marginals(&w, s, l, &mut ws, false);
        assert_eq!(model.compute_guesses(l, &ws), s.labels);
    }
}

/// Serialization: the lattice that comes back is structurally identical and
/// carries its features, and the pairing check rejects the wrong sequence.
#[test]
fn expanded_lattice_round_trips_through_the_record_stream() {
    use seqcascade::io::{LatticeReader, LatticeWriter};

    let labels = Arc::new(label_alphabet(["A", "B"].iter()));
    let names = Names::default();
    let mut model = NgramModel::new(
        NgramConfig {
            order: 1,
            use_position_features: false,
            ..Default::default()
        },
        labels.clone(),
        Box::new(ToyFeatures::new(&labels, names)),
        Box::new(MaxSum),
    );

    let s = seq(3, &["p", "q"], &[1, 0]);
    let base = Lattice::flat(&s, 2, true);
    let all = vec![true; base.num_states()];
    let carried = vec![0.0; base.num_states()];
    let lattice = model.expand_lattice(&s, &base, &carried, &all);

    let mut writer = LatticeWriter::new(Vec::new());
    writer.write(&base).unwrap();
    writer.write(&lattice).unwrap();
    let buf = writer.finish().unwrap();

    let mut reader = LatticeReader::new(&buf[..]);
    let base_back = reader.read_for(&s).unwrap();
    let back = reader.read_for(&s).unwrap();

    assert!(base_back.is_zero_order());
    assert_eq!(back.num_states(), lattice.num_states());
    assert_eq!(back.num_edges(), lattice.num_edges());
    assert_eq!(back.fv_edge, lattice.fv_edge);
    for pos in 0..back.length() {
        for idx in back.state_offset(pos)..back.state_offset(pos + 1) {
            assert_eq!(back.state_id(idx), lattice.state_id(idx));
        }
    }

    // same stream against a different sequence must fail the pairing check
    let other = seq(4, &["r", "s"], &[0, 0]);
    let mut reader = LatticeReader::new(&buf[..]);
    assert!(reader.read_for(&other).is_err());
}
