//! netstrat: an embedded uncertainty-evaluation engine for picking the best
//! network-delivery strategy among uncertain estimators.
//!
//! Dependency order, leaves first: estimators → strategies → evaluators
//! (each owning a joint-distribution model over its estimators) → chooser
//! (ranks strategies through an evaluator) → scheduler (drives the chooser
//! asynchronously or on a timer).

pub mod chooser;
pub mod debug;
pub mod distribution;
pub mod error;
pub mod estimator;
pub mod eval;
pub mod handles;
pub mod memo;
pub mod persistence;
pub mod scheduler;
pub mod strategy;
pub mod weights;

pub use debug::{debug_level, set_debug_level, DebugLevel};
pub use error::{Error, Result};
pub use handles::*;

/// Sets up terminal + rotating file logging at the current debug level.
/// Unlike teacher's own `init()`, there is no ctrl-c hook — this crate has
/// no async runtime to spawn one on.
#[cfg(feature = "cli")]
pub fn init() {
    std::fs::create_dir_all("logs").expect("create logs directory");
    let config = simplelog::ConfigBuilder::new()
        .set_location_level(log::LevelFilter::Off)
        .set_target_level(log::LevelFilter::Off)
        .set_thread_level(log::LevelFilter::Off)
        .build();
    let time = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("time moves slow")
        .as_secs();
    let file = simplelog::WriteLogger::new(
        log::LevelFilter::Debug,
        config.clone(),
        std::fs::File::create(format!("logs/{time}.log")).expect("create log file"),
    );
    let term = simplelog::TermLogger::new(
        debug_level().to_level_filter(),
        config,
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );
    simplelog::CombinedLogger::init(vec![term, file]).expect("initialize logger");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_level_round_trips() {
        set_debug_level(DebugLevel::Debug);
        assert_eq!(debug_level(), DebugLevel::Debug);
        set_debug_level(DebugLevel::Info);
    }
}
