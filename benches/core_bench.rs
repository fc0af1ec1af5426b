//! Benchmarks for strata core operations.
//!
//! Run with: cargo bench
//!
//! Results include 95% confidence intervals via Criterion.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use strata::core::graph::{Graph, GraphBuilder};
use strata::core::types::ComponentConfig;
use strata::core::{parser, planner};
use strata::tripwire::hasher;

/// A component with `n` deployments, each reading the previous one's output
/// plus a shared database.
fn chain_yaml(n: usize) -> String {
    let mut yaml = String::from("databases:\n  main:\n    type: \"postgres:15\"\ndeployments:\n");
    for i in 0..n {
        yaml.push_str(&format!("  svc-{i:04}:\n    image: nginx\n    environment:\n"));
        yaml.push_str("      DB_URL: \"${{ databases.main.url }}\"\n");
        if i > 0 {
            yaml.push_str(&format!(
                "      UPSTREAM: \"${{{{ deployments.svc-{:04}.url }}}}\"\n",
                i - 1
            ));
        }
    }
    yaml
}

fn component(n: usize) -> ComponentConfig {
    parser::parse_component(&chain_yaml(n)).unwrap()
}

fn graph(n: usize) -> Graph {
    let mut builder = GraphBuilder::new();
    builder.add_component("bench", &component(n)).unwrap();
    builder.build().unwrap()
}

fn bench_blake3_json(c: &mut Criterion) {
    let mut group = c.benchmark_group("hash_json");
    for size in [8, 64, 512] {
        let inputs: serde_json::Map<String, serde_json::Value> = (0..size)
            .map(|i| (format!("key_{i}"), serde_json::json!({ "value": i, "tag": "x" })))
            .collect();
        group.bench_with_input(BenchmarkId::from_parameter(size), &inputs, |b, inputs| {
            b.iter(|| black_box(hasher::hash_json(black_box(inputs))));
        });
    }
    group.finish();
}

fn bench_component_parse(c: &mut Criterion) {
    let yaml = chain_yaml(50);
    c.bench_function("component_parse_50", |b| {
        b.iter(|| {
            let component = parser::parse_component(black_box(&yaml)).unwrap();
            black_box(parser::validate_component(&component));
        });
    });
}

fn bench_graph_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("graph_build");
    for n in [10, 100, 500] {
        let component = component(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &component, |b, component| {
            b.iter(|| {
                let mut builder = GraphBuilder::new();
                builder.add_component("bench", black_box(component)).unwrap();
                black_box(builder.build().unwrap());
            });
        });
    }
    group.finish();
}

fn bench_planner_batches(c: &mut Criterion) {
    let mut group = c.benchmark_group("planner_batches");
    for n in [10, 100, 500] {
        let graph = graph(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &graph, |b, graph| {
            b.iter(|| black_box(planner::batches(black_box(graph)).unwrap()));
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_blake3_json,
    bench_component_parse,
    bench_graph_build,
    bench_planner_batches
);
criterion_main!(benches);
