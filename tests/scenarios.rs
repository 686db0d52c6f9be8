//! Integration tests reproducing the concrete scenarios used to validate
//! this crate's behavior end to end, driving the public surface exactly as
//! an embedding application would.
//!
//! The empirical-error evaluator seeds a brand-new estimator's error
//! distribution with the identity sample on its very *first* observation
//! (the observation's own error is folded in starting with the second), and
//! each distribution keeps only the most recent
//! [`netstrat::distribution::MAX_SAMPLES`] entries. Tests below that need a
//! clean, fully-real sample window feed one more observation than that
//! window holds, so the identity seed slides out before any assertion reads
//! the distribution.

use std::sync::{mpsc, Arc};
use std::time::Duration;

use netstrat::distribution::{DistributionKind, MAX_SAMPLES};
use netstrat::estimator::{ConditionKind, EstimatorHandle};
use netstrat::eval::EvalMethod;
use netstrat::scheduler::Scheduler;
use netstrat::strategy::{cost_fn, SingularStrategy, Strategy};
use netstrat::weights::ResourceWeights;
use netstrat::{
    add_observation, choose_strategy, choose_strategy_async, clear_estimator_conditions,
    create_external_estimator, make_strategy, register_strategy_set, register_strategy_set_with_method,
    restore_evaluator_from, save_evaluator_to, set_estimator_condition, set_fixed_resource_weights,
};
use netstrat::chooser::Chooser;

const EMPIRICAL_ABSOLUTE_SAMPLES: EvalMethod = EvalMethod::EmpiricalError {
    distribution: DistributionKind::AllSamples,
    weighted: false,
    mode: netstrat::distribution::ErrorMode::Absolute,
};

/// (a) Trusted oracle, singular win: the cheaper-time strategy wins, and the
/// winner flips as soon as the transfer size crosses the break-even point.
#[test]
fn trusted_oracle_picks_the_cheaper_time() {
    let build = |bytes: f64| {
        let bw0 = EstimatorHandle::new_last_observation("bw0").unwrap();
        let lat0 = EstimatorHandle::new_last_observation("lat0").unwrap();
        bw0.add_observation(5000.0);
        lat0.add_observation(1.0);
        let bw1 = EstimatorHandle::new_last_observation("bw1").unwrap();
        let lat1 = EstimatorHandle::new_last_observation("lat1").unwrap();
        bw1.add_observation(2500.0);
        lat1.add_observation(0.2);

        let (bw0c, lat0c) = (bw0.clone(), lat0.clone());
        let s0 = make_strategy(
            "s0",
            cost_fn(move |ctx, bytes, _| bytes / ctx.value(&bw0c) + ctx.value(&lat0c)),
            cost_fn(|_, _, _| 0.0),
            cost_fn(|_, _, _| 0.0),
            bytes,
            0.0,
        );
        let (bw1c, lat1c) = (bw1.clone(), lat1.clone());
        let s1 = make_strategy(
            "s1",
            cost_fn(move |ctx, bytes, _| bytes / ctx.value(&bw1c) + ctx.value(&lat1c)),
            cost_fn(|_, _, _| 0.0),
            cost_fn(|_, _, _| 0.0),
            bytes,
            0.0,
        );
        let strategies = vec![s0, s1];
        let evaluator = register_strategy_set(&strategies);
        let weights = ResourceWeights::fixed(0.0, 0.0);
        let chooser = Chooser::new(strategies, weights);
        choose_strategy(&chooser, &evaluator, 0.0).unwrap().name()
    };

    assert_eq!(build(4001.0), "s0");
    assert_eq!(build(3999.0), "s1");
}

/// Builds the steady-vs-oscillating bandwidth pair used by scenarios (b) and
/// (e): network A holds at 2000, network B alternates between 1000 and
/// 5000. Returns the estimators unobserved — callers must register an
/// evaluator (so its sink is subscribed) before feeding any observations, or
/// those samples are lost. Observations are fed through the
/// external-estimator path with `new_estimate = 0.0` throughout, so the
/// empirical-error evaluator's composed value for each sample is exactly
/// the raw bandwidth fed in (`compose(0.0, 0.0 - v) == v`), letting the test
/// assert on the same plain numbers the scenario describes.
fn build_steady_vs_oscillating(suffix: &str) -> (EstimatorHandle, EstimatorHandle, Vec<Strategy>) {
    let bw_a = create_external_estimator(&format!("bwA_{suffix}")).unwrap();
    let bw_b = create_external_estimator(&format!("bwB_{suffix}")).unwrap();

    let bw_a_time = bw_a.clone();
    let a = SingularStrategy::new(
        "a",
        cost_fn(move |ctx, bytes, _| bytes / ctx.value(&bw_a_time)),
        cost_fn(|_, _, _| 0.0),
        cost_fn(|_, _, _| 0.5),
        5000.0,
        0.0,
    );
    let bw_b_time = bw_b.clone();
    let b = SingularStrategy::new(
        "b",
        cost_fn(move |ctx, bytes, _| bytes / ctx.value(&bw_b_time)),
        cost_fn(|_, _, _| 0.0),
        cost_fn(|_, _, _| 0.5),
        5000.0,
        0.0,
    );
    let redundant = netstrat::make_redundant_strategy("redundant", vec![a.clone(), b.clone()]);
    let strategies = vec![Strategy::Singular(a), Strategy::Singular(b), redundant];

    (bw_a, bw_b, strategies)
}

/// Feeds one more observation than `MAX_SAMPLES` so the identity-seeded
/// first sample slides out of both windows, leaving a clean 50/50 split of
/// `bw_b` between 1000 and 5000 and a deterministic `bw_a` at 2000.
fn feed_steady_vs_oscillating_history(bw_a: &EstimatorHandle, bw_b: &EstimatorHandle) {
    for i in 0..=MAX_SAMPLES {
        let value = if i % 2 == 0 { 1000.0 } else { 5000.0 };
        add_observation(bw_b, value, 0.0);
        add_observation(bw_a, 2000.0, 0.0);
    }
}

/// (b) Empirical error, redundancy triggered, then suppressed by resource cost.
#[test]
fn empirical_error_redundancy_yields_to_resource_cost() {
    let (bw_a, bw_b, strategies) = build_steady_vs_oscillating("redundancy_cost");
    let evaluator = register_strategy_set_with_method(&strategies, EMPIRICAL_ABSOLUTE_SAMPLES);
    feed_steady_vs_oscillating_history(&bw_a, &bw_b);

    let weights = ResourceWeights::fixed(0.0, 1.0);
    let chooser = Chooser::new(strategies, weights.clone());

    let winner = choose_strategy(&chooser, &evaluator, 0.0).unwrap();
    assert_eq!(winner.name(), "redundant");

    set_fixed_resource_weights(&weights, 99_999_999.0, 99_999_999.0);
    let winner = choose_strategy(&chooser, &evaluator, 0.0).unwrap();
    assert_eq!(winner.name(), "a");
}

/// (c) Conditions pruning flips the winner and un-flips once cleared.
#[test]
fn conditions_pruning_flips_the_winner() {
    let mid = create_external_estimator("mid").unwrap();
    let hilo = create_external_estimator("hilo").unwrap();

    let (midc, hiloc) = (mid.clone(), hilo.clone());
    let mid_strategy = make_strategy(
        "mid",
        cost_fn(move |ctx, _, _| ctx.value(&midc)),
        cost_fn(|_, _, _| 0.0),
        cost_fn(|_, _, _| 0.0),
        0.0,
        0.0,
    );
    let hilo_strategy = make_strategy(
        "hilo",
        cost_fn(move |ctx, _, _| ctx.value(&hiloc)),
        cost_fn(|_, _, _| 0.0),
        cost_fn(|_, _, _| 0.0),
        0.0,
        0.0,
    );
    let strategies = vec![mid_strategy, hilo_strategy];
    let evaluator = register_strategy_set_with_method(&strategies, EMPIRICAL_ABSOLUTE_SAMPLES);

    // One extra feed past `MAX_SAMPLES` evicts the identity-seeded sample;
    // a 4-value cycle divides the remaining window evenly regardless of
    // phase, so "mid" settles at a clean 5.0 and "hilo" at a clean uniform
    // quarter-split over {1, 2, 20, 21}.
    let hilo_cycle = [1.0, 2.0, 20.0, 21.0];
    for i in 0..=MAX_SAMPLES {
        add_observation(&mid, 5.0, 0.0);
        add_observation(&hilo, hilo_cycle[i % hilo_cycle.len()], 0.0);
    }

    let weights = ResourceWeights::fixed(0.0, 0.0);
    let chooser = Chooser::new(strategies, weights);

    assert_eq!(choose_strategy(&chooser, &evaluator, 0.0).unwrap().name(), "mid");

    set_estimator_condition(&hilo, ConditionKind::AtMost, 2.0);
    assert_eq!(choose_strategy(&chooser, &evaluator, 0.0).unwrap().name(), "hilo");

    clear_estimator_conditions(&hilo);
    assert_eq!(choose_strategy(&chooser, &evaluator, 0.0).unwrap().name(), "mid");
}

/// (e) Save/restore round-trips the error distribution itself, not just the
/// estimators' latest values: an evaluator that only ever sees the
/// network in its fast regime (no restore) settles on the plain singular
/// strategy, while one restored from a save made after the full
/// steady-vs-oscillating history keeps preferring the redundant strategy
/// even after one more live observation lands on top of the restored state.
#[test]
fn save_restore_preserves_the_error_distribution() {
    let (bw_a, bw_b, strategies) = build_steady_vs_oscillating("save_restore");
    let evaluator = register_strategy_set_with_method(&strategies, EMPIRICAL_ABSOLUTE_SAMPLES);
    feed_steady_vs_oscillating_history(&bw_a, &bw_b);

    let dir = std::env::temp_dir().join(format!("netstrat-scenario-e-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("empirical.state");
    save_evaluator_to(&evaluator, &path).unwrap();

    // A fresh evaluator that restores the saved history, then receives one
    // more live observation on top of it.
    let restored = register_strategy_set_with_method(&strategies, EMPIRICAL_ABSOLUTE_SAMPLES);
    restore_evaluator_from(&restored, &path).unwrap();
    add_observation(&bw_b, 3000.0, 0.0);
    add_observation(&bw_a, 2000.0, 0.0);
    let weights = ResourceWeights::fixed(0.0, 1.0);
    let chooser = Chooser::new(strategies.clone(), weights);
    let winner = choose_strategy(&chooser, &restored, 0.0).unwrap();
    assert_eq!(winner.name(), "redundant");

    // A fresh evaluator that never restores and has only ever observed the
    // network in its fast regime: no history of the slow swings, so the
    // redundant strategy has no measurable benefit over the plain fast path.
    let naive = register_strategy_set_with_method(&strategies, EMPIRICAL_ABSOLUTE_SAMPLES);
    for _ in 0..=MAX_SAMPLES {
        add_observation(&bw_b, 5000.0, 0.0);
        add_observation(&bw_a, 2000.0, 0.0);
    }
    let weights2 = ResourceWeights::fixed(0.0, 1.0);
    let chooser2 = Chooser::new(strategies, weights2);
    let winner = choose_strategy(&chooser2, &naive, 0.0).unwrap();
    assert_eq!(winner.name(), "b");

    std::fs::remove_file(&path).ok();
}

/// (f) Two async chooser calls on the same two-strategy setup, differing
/// only by `chooser_arg`, resolve to different winners.
#[test]
fn async_choice_depends_on_chooser_arg() {
    let time_x = cost_fn(|_, _, chooser_arg| chooser_arg);
    let time_y = cost_fn(|_, _, chooser_arg| 1.0 - chooser_arg);
    let zero = cost_fn(|_, _, _| 0.0);
    let strategies = vec![
        make_strategy("x", time_x, zero.clone(), zero.clone(), 0.0, 0.0),
        make_strategy("y", time_y, zero.clone(), zero, 0.0, 0.0),
    ];
    let evaluator = register_strategy_set(&strategies);
    let weights = ResourceWeights::fixed(0.0, 0.0);
    let chooser = Arc::new(Chooser::new(strategies, weights));
    let scheduler = Scheduler::new();

    let (tx, rx) = mpsc::channel();
    let tx0 = tx.clone();
    let evaluator0 = evaluator.clone();
    let chooser0 = chooser.clone();
    choose_strategy_async(&scheduler, evaluator0, chooser0, 0.0, move |winner| {
        tx0.send(winner.map(|w| w.name())).unwrap();
    });
    choose_strategy_async(&scheduler, evaluator, chooser, 1.0, move |winner| {
        tx.send(winner.map(|w| w.name())).unwrap();
    });

    let mut got = vec![
        rx.recv_timeout(Duration::from_secs(2)).unwrap(),
        rx.recv_timeout(Duration::from_secs(2)).unwrap(),
    ];
    got.sort();
    assert_eq!(got, vec![Some("x".to_string()), Some("y".to_string())]);
    scheduler.shutdown();
}
