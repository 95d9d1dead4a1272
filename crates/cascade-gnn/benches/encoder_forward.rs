use cascade_gnn::config::{EncoderConfig, SimulationConfig};
use cascade_gnn::encoder::{EncoderWeights, GraphEncoder, PreparedGraph};
use cascade_gnn::normalize::FeatureNormalizer;
use cascade_gnn::params::{ModelParameters, ParameterMask, Stage};
use cascade_gnn::simulate::CounterfactualSimulator;
use cascade_gnn::synthetic::{SyntheticConfig, SyntheticGenerator};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ndarray::Array2;

fn params() -> ModelParameters {
    ModelParameters::new(
        EncoderWeights::init(&EncoderConfig::default()),
        FeatureNormalizer::identity(),
        Stage::Pretrain,
    )
}

fn graphs(nodes: usize) -> Vec<cascade_gnn::graph::InfraGraph> {
    let mut gen = SyntheticGenerator::new(SyntheticConfig {
        min_nodes: nodes,
        max_nodes: nodes,
        ..Default::default()
    })
    .unwrap();
    gen.generate(4).unwrap()
}

fn bench_inference(c: &mut Criterion) {
    let params = params();
    let encoder = GraphEncoder::new(&params);
    let mut group = c.benchmark_group("encoder_inference");

    for size in [10, 30, 100] {
        let graph = graphs(size).remove(0);
        group.bench_with_input(BenchmarkId::from_parameter(size), &graph, |b, graph| {
            b.iter(|| encoder.probabilities(black_box(graph)).unwrap())
        });
    }
    group.finish();
}

fn bench_backward(c: &mut Criterion) {
    let params = params();
    let graph = graphs(30).remove(0);
    let prepared = PreparedGraph::new(&graph, &params.normalizer).unwrap();
    let cache = params.weights.forward(&prepared, None).unwrap();
    let grad = Array2::ones(cache.scores.dim());

    let mut group = c.benchmark_group("encoder_backward");
    group.bench_function("all_groups", |b| {
        let mask = ParameterMask::all_trainable();
        b.iter(|| params.weights.backward(&prepared, &cache, black_box(&grad), &mask).unwrap())
    });
    group.bench_function("gate_only", |b| {
        let mask = ParameterMask::only(&[cascade_gnn::params::ParamGroup::Gate]);
        b.iter(|| params.weights.backward(&prepared, &cache, black_box(&grad), &mask).unwrap())
    });
    group.finish();
}

fn bench_counterfactual(c: &mut Criterion) {
    let params = params();
    let simulator = CounterfactualSimulator::new(&params, SimulationConfig::default()).unwrap();
    let graph = graphs(30).remove(0);

    c.bench_function("simulate_single_failure", |b| {
        b.iter(|| simulator.simulate(black_box(&graph), 0).unwrap())
    });
}

criterion_group!(benches, bench_inference, bench_backward, bench_counterfactual);
criterion_main!(benches);
