//! File-backed save/restore for evaluators. The line-oriented
//! format itself is owned by each evaluator's [`Persist`](crate::eval::Persist)
//! impl; this module is just the atomic file-handling wrapper around it.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use crate::eval::{AnyEvaluator, Persist};
use crate::error::{Error, Result};

/// Writes `evaluator`'s state to `path`. The evaluator's own lock is held for
/// the duration of `save_to`, so the write is atomic from the rest of the
/// process's viewpoint; a crash mid-write can still leave a truncated file on
/// disk, which is why `restore_from` always clears state before loading —
/// callers shouldn't restore from a save that didn't complete.
pub fn save_evaluator(evaluator: &AnyEvaluator, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path).map_err(|e| Error::io(path.display().to_string(), e))?;
    let mut out = BufWriter::new(file);
    evaluator
        .save_to(&mut out)
        .map_err(|e| Error::io(path.display().to_string(), e))
}

/// Restores `evaluator`'s state from `path`. Replaces all prior state —
/// partial restores must leave the evaluator clean rather than half-updated.
pub fn restore_evaluator(evaluator: &AnyEvaluator, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| Error::io(path.display().to_string(), e))?;
    let mut input = BufReader::new(file);
    evaluator.restore_from(&mut input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::oracle::TrustedOracle;

    #[test]
    fn stateless_oracle_round_trips_through_a_file() {
        let evaluator = AnyEvaluator::Oracle(TrustedOracle::new());
        let dir = std::env::temp_dir().join(format!("netstrat-persist-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("oracle.state");
        save_evaluator(&evaluator, &path).unwrap();
        restore_evaluator(&evaluator, &path).unwrap();
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn missing_file_surfaces_as_io_error() {
        let evaluator = AnyEvaluator::Oracle(TrustedOracle::new());
        let result = restore_evaluator(&evaluator, "/nonexistent/path/for/netstrat/tests");
        assert!(matches!(result, Err(Error::Io { .. })));
    }
}
