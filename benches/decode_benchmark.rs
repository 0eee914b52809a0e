use criterion::{criterion_group, criterion_main, Criterion};

use seqcascade::lattice::{Lattice, Topology};
use seqcascade::{MaxSum, Sequence, SumProduct, Viterbi, Workspace};

struct Dense(u32);

impl Topology for Dense {
    fn previous_states(&self, _state: u32) -> Vec<u32> {
        (0..self.0).collect()
    }

    fn next_states(&self, _state: u32) -> Vec<u32> {
        (0..self.0).collect()
    }
}

fn dense_lattice(length: usize, labels: u32) -> Lattice {
    let seq = Sequence::new(
        0,
        (0..length).map(|i| format!("w{}", i)).collect(),
        vec![0; length],
    );
    let mut offsets = Vec::with_capacity(length + 1);
    for p in 0..=length {
        offsets.push(p as u32 * labels);
    }
    let mut ids = Vec::new();
    for _ in 0..length {
        ids.extend(0..labels);
    }
    Lattice::from_states(
        seq.content_hash(),
        length,
        ids,
        offsets,
        Vec::new(),
        &Dense(labels),
    )
}

fn bench_decode(c: &mut Criterion) {
    let lattice = dense_lattice(40, 45);
    let scores: Vec<f64> = (0..lattice.num_edges())
        .map(|e| (e.wrapping_mul(2654435761) % 1000) as f64 / 500.0 - 1.0)
        .collect();

    let mut ws = Workspace::default();
    ws.prepare(&lattice);
    ws.edge_scores[..scores.len()].copy_from_slice(&scores);

    let mut group = c.benchmark_group("decode");
    group.bench_function("max_sum", |b| {
        b.iter(|| {
            let Workspace {
                edge_scores,
                alpha_vals,
                beta_vals,
                alpha_args,
                beta_args,
                marginals,
                ..
            } = &mut ws;
            let v = MaxSum;
            v.compute_alpha(&lattice, edge_scores, alpha_vals, alpha_args);
            v.compute_beta(&lattice, edge_scores, beta_vals, beta_args);
            v.compute_edge_marginals(&lattice, edge_scores, alpha_vals, beta_vals, marginals);
        })
    });
    group.bench_function("sum_product", |b| {
        b.iter(|| {
            let Workspace {
                edge_scores,
                alpha_vals,
                beta_vals,
                alpha_args,
                beta_args,
                marginals,
                ..
            } = &mut ws;
            let v = SumProduct;
            v.compute_alpha(&lattice, edge_scores, alpha_vals, alpha_args);
            v.compute_beta(&lattice, edge_scores, beta_vals, beta_args);
            v.compute_edge_marginals(&lattice, edge_scores, alpha_vals, beta_vals, marginals);
        })
    });
    group.finish();
}

criterion_group!(benches, bench_decode);
criterion_main!(benches);
