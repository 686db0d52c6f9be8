use std::sync::Arc;
use std::time::Duration;

use criterion::black_box;
use criterion::criterion_group;
use criterion::criterion_main;
use criterion::Criterion;

use netstrat::distribution::{DistributionKind, ErrorMode, MAX_SAMPLES};
use netstrat::estimator::EstimatorHandle;
use netstrat::eval::empirical::EmpiricalErrorEvaluator;
use netstrat::eval::{ComparisonType, EvalMethod, Evaluator};
use netstrat::strategy::{cost_fn, redundant_min_time, RedundantStrategy, SingularStrategy, Strategy};

const EMPIRICAL_ABSOLUTE_SAMPLES: EvalMethod = EvalMethod::EmpiricalError {
    distribution: DistributionKind::AllSamples,
    weighted: false,
    mode: ErrorMode::Absolute,
};

/// A redundant strategy of `n` children, each keyed off its own estimator
/// (no shared estimators, so the disjoint/memoized combine path applies),
/// with every estimator's error distribution filled to a full
/// `MAX_SAMPLES` window before the timed loop starts.
fn build_redundant(n: usize) -> (Arc<EmpiricalErrorEvaluator>, Strategy) {
    let evaluator = EmpiricalErrorEvaluator::new(EMPIRICAL_ABSOLUTE_SAMPLES);
    let children: Vec<Arc<SingularStrategy>> = (0..n)
        .map(|i| {
            let bw = EstimatorHandle::new_external(&format!("bw{i}")).unwrap();
            bw.subscribe(evaluator.clone());
            for sample in 0..=MAX_SAMPLES {
                bw.add_observation_external(1000.0 + sample as f64, 0.0);
            }
            let bw_time = bw.clone();
            SingularStrategy::new(
                format!("s{i}"),
                cost_fn(move |ctx, bytes, _| bytes / ctx.value(&bw_time)),
                cost_fn(|_, _, _| 0.0),
                cost_fn(|_, _, _| 0.0),
                5000.0,
                0.0,
            )
        })
        .collect();
    let redundant = RedundantStrategy::new("r", children);
    (evaluator, Strategy::Redundant(redundant))
}

fn bench_joint_iteration(c: &mut Criterion) {
    let mut group = c.benchmark_group("Joint Iteration");
    group
        .sample_size(10)
        .measurement_time(Duration::from_secs(5))
        .warm_up_time(Duration::from_secs(1));
    for n in [1usize, 2, 3, 4] {
        let (evaluator, strategy) = build_redundant(n);
        group.bench_function(format!("{n} disjoint children"), |b| {
            b.iter(|| {
                black_box(evaluator.expected_value(
                    &strategy,
                    &redundant_min_time(),
                    0.0,
                    0.0,
                    ComparisonType::SingularToSingular,
                ))
            })
        });
    }
    group.finish();
}

criterion_group!(
    name = benches;
    config = Criterion::default()
        .sample_size(10)
        .measurement_time(Duration::from_secs(5))
        .warm_up_time(Duration::from_secs(1));
    targets = bench_joint_iteration
);
criterion_main!(benches);
