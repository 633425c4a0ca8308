//! Test Run Pipeline - High-Level Orchestration
//!
//! **Stages:**
//! `New → Cloned → Scanned → BuiltJob → Executed → Extracted → Done`
//!
//! Every stage may fail the run, except that a failed execution which still
//! produced output moves on to extraction: partial credit is not thrown away.
//!
//! All run-scoped state (temp directory, secret, job) is created inside
//! [`Pipeline::run_tests`], so concurrent calls, even for the same RunData,
//! never share anything but the metrics handle.

use crate::clone::{self, CloneError, RepoInfo, Scm};
use crate::engine::{RunError, Runner};
use crate::evaluator::{self, ExtractError};
use crate::metrics::{Metrics, Outcome};
use crate::scan::{self, ScanError};
use crate::script::{self, ScriptError};
use crate::secret;
use gradekit_common::types::{
    Results, RunData, RunReport, RunStatus, ASSIGNMENTS_REPO, TESTS_REPO,
};
use gradekit_common::Config;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Prefix of the per-run temporary directory
const TEMP_DIR_PREFIX: &str = "gradekit-tests";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    New,
    Cloned,
    Scanned,
    BuiltJob,
    Executed,
    Extracted,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::New => "new",
            Stage::Cloned => "cloned",
            Stage::Scanned => "scanned",
            Stage::BuiltJob => "built-job",
            Stage::Executed => "executed",
            Stage::Extracted => "extracted",
            Stage::Done => "done",
        };
        f.write_str(name)
    }
}

/// Failures before anything was executed
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("failed to create run directory: {0}")]
    TempDir(#[source] std::io::Error),
    #[error(transparent)]
    Clone(#[from] CloneError),
    #[error("unsafe repository content: {0}")]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Script(#[from] ScriptError),
}

/// Coarse error categories crossing the pipeline boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Setup,
    Execution,
    Cancelled,
    NoScores,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{label}: setup failed in stage {stage}: {source}")]
    Setup {
        label: String,
        stage: Stage,
        #[source]
        source: SetupError,
    },
    #[error("{label}: test execution failed without output: {source}")]
    Execution {
        label: String,
        #[source]
        source: RunError,
    },
    #[error("{label}: cancelled in stage {stage}")]
    Cancelled { label: String, stage: Stage },
    #[error("{label}: no score records found in test output")]
    NoScores { label: String, results: Results },
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Setup { .. } => ErrorKind::Setup,
            PipelineError::Execution { .. } => ErrorKind::Execution,
            PipelineError::Cancelled { .. } => ErrorKind::Cancelled,
            PipelineError::NoScores { .. } => ErrorKind::NoScores,
        }
    }

    /// Configuration errors will fail the same way on every retry
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            PipelineError::Setup {
                source: SetupError::Script(_),
                ..
            }
        )
    }
}

/// Summarize a pipeline outcome for the result queue
pub fn report(label: String, outcome: Result<Results, PipelineError>) -> RunReport {
    let err = match outcome {
        Ok(results) => {
            return RunReport {
                label,
                status: RunStatus::Succeeded,
                error: None,
                results: Some(results),
            }
        }
        Err(err) => err,
    };

    let status = match err.kind() {
        ErrorKind::Setup => RunStatus::SetupFailed,
        ErrorKind::Execution => RunStatus::ExecutionFailed,
        ErrorKind::Cancelled => RunStatus::Cancelled,
        ErrorKind::NoScores => RunStatus::NoScores,
    };
    let error = Some(err.to_string());
    let results = match err {
        PipelineError::NoScores { results, .. } => Some(results),
        _ => None,
    };
    RunReport {
        label,
        status,
        error,
        results,
    }
}

/// Runs the test pipeline for submissions
///
/// Cheap to share behind an `Arc`; holds no per-run state.
pub struct Pipeline {
    scm: Arc<dyn Scm>,
    runner: Arc<dyn Runner>,
    metrics: Arc<Metrics>,
    config: Config,
}

impl Pipeline {
    pub fn new(
        scm: Arc<dyn Scm>,
        runner: Arc<dyn Runner>,
        metrics: Arc<Metrics>,
        config: Config,
    ) -> Self {
        Self {
            scm,
            runner,
            metrics,
            config,
        }
    }

    /// Run the tests for one submission and return its score results.
    ///
    /// The run directory is removed when this returns, on every path.
    pub async fn run_tests(
        &self,
        run: &RunData,
        cancel: &CancellationToken,
    ) -> Result<Results, PipelineError> {
        let span = tracing::info_span!("run_tests", label = %run.label());
        self.run_stages(run, cancel).instrument(span).await
    }

    async fn run_stages(
        &self,
        run: &RunData,
        cancel: &CancellationToken,
    ) -> Result<Results, PipelineError> {
        let label = run.label();
        let owner = run.job_owner.as_str();
        let course = run.course.code.as_str();
        let setup_failed = |stage: Stage, source: SetupError| PipelineError::Setup {
            label: label.clone(),
            stage,
            source,
        };

        self.metrics.record(Outcome::Started, owner, course);

        // Removed on drop, whichever way this function returns
        let work_dir = tempfile::Builder::new()
            .prefix(TEMP_DIR_PREFIX)
            .tempdir()
            .map_err(|err| setup_failed(Stage::New, SetupError::TempDir(err)))?;
        tracing::debug!(dir = %work_dir.path().display(), "Cloning repositories");

        let repos = [
            RepoInfo::new(&run.repo_name, Some(run.branch.clone())),
            RepoInfo::new(TESTS_REPO, None),
            RepoInfo::new(ASSIGNMENTS_REPO, None),
        ];
        match clone::clone_repositories(
            self.scm.as_ref(),
            &run.course.organization_path,
            &repos,
            work_dir.path(),
            cancel,
        )
        .await
        {
            Ok(_) => {}
            Err(CloneError::Cancelled) => {
                return Err(PipelineError::Cancelled {
                    label,
                    stage: Stage::New,
                })
            }
            Err(err) => return Err(setup_failed(Stage::New, err.into())),
        }
        tracing::debug!(stage = %Stage::Cloned, "Scanning submission");

        scan::scan_student_repo(&work_dir.path().join(&run.repo_name))
            .map_err(|err| setup_failed(Stage::Cloned, err.into()))?;
        tracing::debug!(stage = %Stage::Scanned, "Building job");

        let secret = secret::generate();
        let sandbox_root = self.runner.sandbox_root(work_dir.path());
        let job = script::build_job(run, &secret, work_dir.path(), &sandbox_root, &self.config)
            .map_err(|err| setup_failed(Stage::Scanned, err.into()))?;

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled {
                label,
                stage: Stage::BuiltJob,
            });
        }
        tracing::debug!(
            stage = %Stage::BuiltJob,
            image = %job.image,
            deadline = ?job.deadline,
            "Running tests"
        );

        let start = Instant::now();
        let result = self.runner.run(&job, cancel).await;
        let elapsed = start.elapsed();
        self.metrics.observe_execution(owner, course, elapsed);

        let out = match result {
            Ok(out) => out,
            Err(err) if err.is_without_output() => {
                self.metrics.record(Outcome::FailedWithoutOutput, owner, course);
                if matches!(err, RunError::Cancelled { .. }) {
                    return Err(PipelineError::Cancelled {
                        label,
                        stage: Stage::BuiltJob,
                    });
                }
                return Err(PipelineError::Execution { label, source: err });
            }
            Err(err) => {
                // typically a timeout with some output; keep going for partial credit
                self.metrics.record(Outcome::FailedWithOutput, owner, course);
                tracing::error!(error = %err, "Test execution failed with output");
                match err {
                    RunError::Timeout { output, .. }
                    | RunError::ExitStatus { output, .. }
                    | RunError::Cancelled { output } => output,
                    RunError::Spawn(_) | RunError::Docker(_) => String::new(),
                }
            }
        };
        tracing::debug!(stage = %Stage::Executed, bytes = out.len(), "Extracting results");

        let results = match evaluator::extract_results(&out, &secret, elapsed) {
            Ok(results) => results,
            Err(ExtractError::NotFound { results, rejected }) => {
                self.metrics.record(Outcome::ExtractionFailed, owner, course);
                tracing::error!(rejected = rejected.len(), "No score records found");
                return Err(PipelineError::NoScores { label, results });
            }
            Err(err) => {
                self.metrics.record(Outcome::ExtractionFailed, owner, course);
                tracing::warn!(
                    accepted = err.results().scores.len(),
                    rejected = err.rejected().len(),
                    "Some score records were rejected"
                );
                for rejected in err.rejected() {
                    tracing::warn!(reason = %rejected, "Score record rejected");
                }
                err.into_results()
            }
        };

        tracing::debug!(
            stage = %Stage::Extracted,
            scores = results.scores.len(),
            "Scores extracted"
        );

        self.metrics.record(Outcome::Succeeded, owner, course);
        tracing::debug!(stage = %Stage::Done, "Tests completed");
        Ok(results)
    }
}
