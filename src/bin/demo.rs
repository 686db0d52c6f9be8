//! Interactive demo for the strategy chooser.
//!
//! Sets up two singular strategies (a direct TCP-like path and a forward-
//! error-corrected path) over bandwidth/latency estimators, lets the caller
//! feed observations either from `--sample` flags or interactively, then
//! reports the chosen strategy under the requested evaluator method.

use anyhow::Result;
use clap::Parser;
use colored::Colorize;
use dialoguer::{Confirm, Input};

use netstrat::chooser::Chooser;
use netstrat::estimator::EstimatorHandle;
use netstrat::eval::EvalMethod;
use netstrat::strategy::{cost_fn, EvalContext};
use netstrat::weights::ResourceWeights;
use netstrat::{choose_strategy, make_strategy, register_strategy_set_with_method, DebugLevel};

#[derive(Parser, Debug)]
#[command(name = "netstrat-demo", about = "Pick a network strategy under uncertainty")]
struct Args {
    /// Bandwidth observations (bytes/sec) fed to the estimator before choosing.
    #[arg(long = "bw-sample", num_args = 0..)]
    bw_samples: Vec<f64>,

    /// Latency observations (seconds) fed to the estimator before choosing.
    #[arg(long = "lat-sample", num_args = 0..)]
    lat_samples: Vec<f64>,

    /// Transfer size in bytes used by the `strategy_arg` of each strategy.
    #[arg(long, default_value_t = 4_000_000.0)]
    transfer_bytes: f64,

    /// Prompt interactively for additional samples.
    #[arg(long)]
    interactive: bool,

    /// Print debug-level logs.
    #[arg(long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    netstrat::set_debug_level(if args.verbose { DebugLevel::Debug } else { DebugLevel::Info });
    netstrat::init();

    let bandwidth = EstimatorHandle::new_running_mean("bandwidth")?;
    let latency = EstimatorHandle::new_running_mean("latency")?;

    for sample in &args.bw_samples {
        bandwidth.add_observation(*sample);
    }
    for sample in &args.lat_samples {
        latency.add_observation(*sample);
    }

    if args.interactive {
        loop {
            let value: f64 = Input::new()
                .with_prompt("bandwidth sample (bytes/sec)")
                .interact_text()?;
            bandwidth.add_observation(value);
            let value: f64 = Input::new().with_prompt("latency sample (sec)").interact_text()?;
            latency.add_observation(value);
            if !Confirm::new().with_prompt("add another sample?").default(false).interact()? {
                break;
            }
        }
    }

    if !bandwidth.has_estimate() || !latency.has_estimate() {
        println!(
            "{}",
            "no samples recorded yet; pass --bw-sample/--lat-sample or --interactive".yellow()
        );
        return Ok(());
    }

    let direct_bw = bandwidth.clone();
    let direct_lat = latency.clone();
    let direct_time = cost_fn(move |ctx, sarg, _carg| sarg / ctx.value(&direct_bw) + ctx.value(&direct_lat));
    let zero = cost_fn(|_ctx, _sarg, _carg| 0.0);
    let direct = make_strategy("direct", direct_time, zero.clone(), zero.clone(), args.transfer_bytes, 0.0);

    let fec_bw = bandwidth.clone();
    let fec_lat = latency.clone();
    // Forward error correction sends 1.2x the payload to tolerate loss, at
    // the cost of proportionally more energy/data.
    let fec_time = cost_fn(move |ctx, sarg, _carg| (sarg * 1.2) / ctx.value(&fec_bw) + ctx.value(&fec_lat));
    let fec_energy = cost_fn(|_ctx, sarg, _carg| sarg * 0.2);
    let fec_data = cost_fn(|_ctx, sarg, _carg| sarg * 0.2);
    let fec = make_strategy("fec", fec_time, fec_energy, fec_data, args.transfer_bytes, 0.0);

    let strategies = vec![direct, fec];
    let evaluator = register_strategy_set_with_method(&strategies, EvalMethod::TrustedOracle);
    let weights = ResourceWeights::fixed(1.0, 1.0);
    let chooser = Chooser::new(strategies, weights);

    match choose_strategy(&chooser, &evaluator, 0.0) {
        Some(winner) => {
            let time = chooser.get_last_strategy_time(&winner).unwrap_or(f64::NAN);
            println!(
                "{} {} ({:.3}s expected)",
                "chose:".green().bold(),
                winner.name(),
                time
            );
        }
        None => println!("{}", "no strategy registered".red()),
    }

    Ok(())
}
