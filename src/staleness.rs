//! Decides whether a task needs to run.
//!
//! Nothing here is cached: every evaluation reads artifact timestamps from
//! the filesystem, so an input touched by someone else makes its consumers
//! stale on the very next query without any explicit invalidation.

use std::time::SystemTime;

use crate::artifact::Artifact;
use crate::core::NEVER;

/// A snapshot of everything the staleness rules look at for one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Staleness {
    /// Newest modification time over the existing inputs, [`NEVER`] when
    /// there are none.
    pub latest_input: SystemTime,
    /// Oldest modification time over the existing outputs, the call time
    /// when there are none.
    pub earliest_output: SystemTime,
    /// Every declared output currently exists.
    pub all_outputs_exist: bool,
    /// When the task was last invoked, [`NEVER`] if it wasn't.
    pub call_time: SystemTime,
}

impl Staleness {
    pub fn evaluate(requires: &[Artifact], provides: &[Artifact], call_time: SystemTime) -> Self {
        let latest_input = requires
            .iter()
            .filter_map(Artifact::modified_at)
            .max()
            .unwrap_or(NEVER);

        let outputs: Vec<Option<SystemTime>> = provides.iter().map(Artifact::modified_at).collect();

        let earliest_output = outputs.iter().flatten().min().copied().unwrap_or(call_time);
        let all_outputs_exist = outputs.iter().all(Option::is_some);

        Self {
            latest_input,
            earliest_output,
            all_outputs_exist,
            call_time,
        }
    }

    pub fn has_run(&self) -> bool {
        self.call_time > NEVER
    }

    /// No input changed after the last run, and every output was written at
    /// or after it.
    pub fn outputs_up_to_date(&self) -> bool {
        self.all_outputs_exist
            && self.latest_input <= self.call_time
            && self.call_time <= self.earliest_output
    }

    pub fn needs_run(&self) -> bool {
        !(self.has_run() && self.outputs_up_to_date())
    }
}

#[cfg(test)]
mod tests {
    use std::fs::{self, File};
    use std::time::Duration;

    use camino::Utf8Path;

    use super::*;
    use crate::artifact::ArtifactRegistry;

    fn at(secs: u64) -> SystemTime {
        NEVER + Duration::from_secs(secs)
    }

    fn state(latest_input: u64, earliest_output: u64, exist: bool, call: u64) -> Staleness {
        Staleness {
            latest_input: at(latest_input),
            earliest_output: at(earliest_output),
            all_outputs_exist: exist,
            call_time: at(call),
        }
    }

    fn set_mtime(path: &Utf8Path, time: SystemTime) {
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(time)
            .unwrap();
    }

    #[test]
    fn test_never_run_always_needs_run() {
        let s = state(0, 0, true, 0);
        assert!(!s.has_run());
        assert!(s.outputs_up_to_date());
        assert!(s.needs_run());
    }

    #[test]
    fn test_ordering_rules() {
        // input <= call <= output
        assert!(!state(10, 30, true, 20).needs_run());
        // equal timestamps are fine on both sides
        assert!(!state(20, 20, true, 20).needs_run());
        // input newer than the run
        assert!(state(25, 30, true, 20).needs_run());
        // output older than the run
        assert!(state(10, 15, true, 20).needs_run());
        // an output is missing
        assert!(state(10, 30, false, 20).needs_run());
    }

    #[test]
    fn test_side_effect_only_task() {
        let s = Staleness::evaluate(&[], &[], at(5));
        assert_eq!(s.latest_input, NEVER);
        assert_eq!(s.earliest_output, at(5));
        assert!(s.all_outputs_exist);
        assert!(!s.needs_run());
    }

    #[test]
    fn test_evaluate_reads_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let mut registry = ArtifactRegistry::new(root);

        let input = registry.resolve("in.dat");
        let output = registry.resolve("out.dat");
        let missing = registry.resolve("missing.dat");

        fs::write(input.path(), "in").unwrap();
        fs::write(output.path(), "out").unwrap();
        set_mtime(input.path(), at(100));
        set_mtime(output.path(), at(300));

        let s = Staleness::evaluate(
            &[input.clone(), missing.clone()],
            std::slice::from_ref(&output),
            at(200),
        );
        assert_eq!(s.latest_input, at(100));
        assert_eq!(s.earliest_output, at(300));
        assert!(!s.needs_run());

        // touched after the run
        set_mtime(input.path(), at(250));
        let s = Staleness::evaluate(std::slice::from_ref(&input), std::slice::from_ref(&output), at(200));
        assert!(s.needs_run());

        // declared output not produced
        let s = Staleness::evaluate(&[], &[output, missing], at(200));
        assert!(!s.all_outputs_exist);
        assert!(s.needs_run());
    }
}
