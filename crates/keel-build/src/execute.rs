use std::future::Future;

use crate::error::BuildError;
use crate::plan::{BuildPlan, Step, StepKindName};

/// Result of running a single step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutput {
    pub success: bool,
    /// Captured installer output, used as the failure diagnostic.
    pub diagnostic: String,
}

impl StepOutput {
    pub fn ok() -> Self {
        Self {
            success: true,
            diagnostic: String::new(),
        }
    }

    pub fn failed(diagnostic: impl Into<String>) -> Self {
        Self {
            success: false,
            diagnostic: diagnostic.into(),
        }
    }
}

/// Executes individual plan steps. The production implementation shells out to
/// the system package manager and pip; tests record calls.
pub trait StepRunner {
    fn run(&mut self, index: usize, step: &Step) -> impl Future<Output = StepOutput> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepOutcome {
    Succeeded,
    /// Failed, but the step was best-effort.
    Tolerated,
    /// Failed and handed over to its fallback.
    FellBack,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct StepRecord {
    pub index: usize,
    pub kind: StepKindName,
    pub outcome: StepOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct BuildReport {
    pub records: Vec<StepRecord>,
}

fn record(report: &mut BuildReport, index: usize, step: &Step, outcome: StepOutcome) {
    report.records.push(StepRecord {
        index,
        kind: step.kind.name(),
        outcome,
    });
}

/// Runs `plan` in order. Stops at the first required step that fails (after its
/// fallback, if it has one). Nothing is rolled back; the caller discards the layer.
pub async fn execute<R: StepRunner>(
    plan: &BuildPlan,
    runner: &mut R,
) -> Result<BuildReport, BuildError> {
    plan.validate()?;

    let mut report = BuildReport::default();

    for index in plan.primary_indices() {
        let step = &plan.steps[index];
        tracing::info!(step_index = index, kind = %step.kind.name(), "running build step");

        let out = runner.run(index, step).await;
        if out.success {
            record(&mut report, index, step, StepOutcome::Succeeded);
            continue;
        }

        let (failed_index, failed_step, diagnostic) = match step.fallback {
            Some(fb_index) => {
                record(&mut report, index, step, StepOutcome::FellBack);
                let fb = &plan.steps[fb_index];
                tracing::warn!(
                    step_index = index,
                    fallback_index = fb_index,
                    kind = %step.kind.name(),
                    "build step failed; running fallback"
                );
                let fb_out = runner.run(fb_index, fb).await;
                if fb_out.success {
                    record(&mut report, fb_index, fb, StepOutcome::Succeeded);
                    continue;
                }
                let diagnostic = format!(
                    "{}\n--- fallback step {} ({}) ---\n{}",
                    out.diagnostic,
                    fb_index,
                    fb.kind.name(),
                    fb_out.diagnostic
                );
                (fb_index, fb, diagnostic)
            }
            None => (index, step, out.diagnostic),
        };

        if step.must_succeed {
            record(&mut report, failed_index, failed_step, StepOutcome::Failed);
            tracing::error!(
                step_index = failed_index,
                kind = %failed_step.kind.name(),
                "required build step failed; aborting"
            );
            return Err(BuildError::StepExecutionFailure {
                index: failed_index,
                kind: failed_step.kind.name(),
                diagnostic,
            });
        }

        record(&mut report, failed_index, failed_step, StepOutcome::Tolerated);
        tracing::warn!(
            step_index = failed_index,
            kind = %failed_step.kind.name(),
            "best-effort build step failed; continuing"
        );
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::plan::{Constraints, StepKind, resolve};
    use crate::requirements::Requirement;

    /// Records every call and fails the configured step indices.
    #[derive(Debug, Default)]
    struct RecordingRunner {
        calls: Vec<(usize, StepKindName)>,
        fail: BTreeSet<usize>,
    }

    impl RecordingRunner {
        fn failing(indices: &[usize]) -> Self {
            Self {
                calls: Vec::new(),
                fail: indices.iter().copied().collect(),
            }
        }
    }

    impl StepRunner for RecordingRunner {
        async fn run(&mut self, index: usize, step: &Step) -> StepOutput {
            self.calls.push((index, step.kind.name()));
            if self.fail.contains(&index) {
                StepOutput::failed(format!("step {index} exploded"))
            } else {
                StepOutput::ok()
            }
        }
    }

    fn required_plan(n: usize) -> BuildPlan {
        let mut plan = BuildPlan::default();
        for i in 0..n {
            plan.push(Step::required(StepKind::SystemPackage {
                packages: vec![format!("pkg-{i}")],
            }));
        }
        plan
    }

    fn indices(runner: &RecordingRunner) -> Vec<usize> {
        runner.calls.iter().map(|(i, _)| *i).collect()
    }

    #[tokio::test]
    async fn all_required_steps_run_in_declared_order() {
        let plan = required_plan(4);
        let mut runner = RecordingRunner::default();
        let report = execute(&plan, &mut runner).await.unwrap();
        assert_eq!(indices(&runner), vec![0, 1, 2, 3]);
        assert!(report
            .records
            .iter()
            .all(|r| r.outcome == StepOutcome::Succeeded));
    }

    #[tokio::test]
    async fn required_failure_aborts_before_later_steps() {
        let plan = required_plan(4);
        let mut runner = RecordingRunner::failing(&[1]);
        let err = execute(&plan, &mut runner).await.unwrap_err();
        assert_eq!(indices(&runner), vec![0, 1]);
        match err {
            BuildError::StepExecutionFailure {
                index,
                kind,
                diagnostic,
            } => {
                assert_eq!(index, 1);
                assert_eq!(kind, StepKindName::SystemPackage);
                assert!(diagnostic.contains("step 1 exploded"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn best_effort_failure_does_not_fail_the_build() {
        let plan = resolve(&[], Constraints::default()).unwrap();
        let mut runner = RecordingRunner::failing(&[0]);
        let report = execute(&plan, &mut runner).await.unwrap();
        assert_eq!(report.records[0].outcome, StepOutcome::Tolerated);
    }

    #[tokio::test]
    async fn fallback_only_runs_when_parent_fails() {
        let reqs = vec![Requirement::pinned("pandas", "2.2.2")];
        let plan = resolve(&reqs, Constraints::default()).unwrap();
        // 0 python-upgrade, 1 binary-only (fallback 2), 2 source-install, 3 cache-clean

        let mut runner = RecordingRunner::default();
        execute(&plan, &mut runner).await.unwrap();
        assert_eq!(indices(&runner), vec![0, 1, 3]);

        let mut runner = RecordingRunner::failing(&[1]);
        let report = execute(&plan, &mut runner).await.unwrap();
        assert_eq!(indices(&runner), vec![0, 1, 2, 3]);
        assert_eq!(report.records[1].outcome, StepOutcome::FellBack);
        assert_eq!(report.records[2].index, 2);
        assert_eq!(report.records[2].outcome, StepOutcome::Succeeded);
    }

    #[tokio::test]
    async fn failed_fallback_of_required_step_aborts() {
        let reqs = vec![Requirement::pinned("pandas", "2.2.2")];
        let plan = resolve(&reqs, Constraints::default()).unwrap();

        let mut runner = RecordingRunner::failing(&[1, 2]);
        let err = execute(&plan, &mut runner).await.unwrap_err();
        assert_eq!(indices(&runner), vec![0, 1, 2]);
        let BuildError::StepExecutionFailure {
            index, diagnostic, ..
        } = err
        else {
            panic!("expected step failure");
        };
        assert_eq!(index, 2);
        assert!(diagnostic.contains("step 1 exploded"));
        assert!(diagnostic.contains("step 2 exploded"));
    }

    #[tokio::test]
    async fn executing_twice_records_identical_sequences() {
        let reqs = vec![
            Requirement::pinned("fastapi", "0.111.0"),
            Requirement::native("ta-lib", "0.4.28", &["libta-lib-dev"]),
        ];
        let plan = resolve(&reqs, Constraints::default()).unwrap();

        let mut first = RecordingRunner::default();
        let mut second = RecordingRunner::default();
        let a = execute(&plan, &mut first).await.unwrap();
        let b = execute(&plan, &mut second).await.unwrap();
        assert_eq!(first.calls, second.calls);
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn invalid_plan_runs_nothing() {
        let mut plan = required_plan(2);
        plan.steps[0].fallback = Some(9);
        let mut runner = RecordingRunner::default();
        let err = execute(&plan, &mut runner).await.unwrap_err();
        assert!(matches!(err, BuildError::InvalidPlan(_)));
        assert!(runner.calls.is_empty());
    }
}
