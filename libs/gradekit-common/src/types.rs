use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Name of the course repository holding the instructor tests
pub const TESTS_REPO: &str = "tests";

/// Name of the course repository holding the assignment skeletons
pub const ASSIGNMENTS_REPO: &str = "assignments";

/// Number of commit id characters kept in a job label
const COMMIT_PREFIX_LEN: usize = 7;

/// Course configuration relevant to test runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Course {
    pub code: String,
    pub name: String,
    pub organization_path: String,
    /// Container image used when the run script does not name one
    #[serde(default)]
    pub image: Option<String>,
    /// Extra environment handed to every sandbox of this course
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Assignment configuration relevant to test runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub name: String,
    /// Inline run script template; takes precedence over the tests repository
    #[serde(default)]
    pub script_template: Option<String>,
    /// Literal commands used when no run script exists
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub container_timeout_ms: Option<u64>,
}

/// Run Data (Immutable Input)
/// Names one submission to test. Constructed per request and never mutated
/// while the run is in flight; persisting it is the caller's business.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunData {
    pub course: Course,
    pub assignment: Assignment,
    pub repo_name: String,
    pub branch: String,
    pub commit_id: String,
    /// User or group login owning the submission
    pub job_owner: String,
    #[serde(default)]
    pub rebuild: bool,
}

impl RunData {
    /// Short label for logs and metric grouping; not an identity.
    pub fn label(&self) -> String {
        let commit: String = self.commit_id.chars().take(COMMIT_PREFIX_LEN).collect();
        format!(
            "{}-{}-{}-{}",
            self.course.code.to_lowercase(),
            self.assignment.name,
            self.job_owner,
            commit
        )
    }
}

impl fmt::Display for RunData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// What to execute inside the sandbox: literal commands or a whole script
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exec {
    Commands(Vec<String>),
    Script(String),
}

impl Exec {
    /// Shell text handed to `sh -c`.
    /// Commands run in order and stop at the first failure.
    pub fn to_shell(&self) -> String {
        match self {
            Exec::Commands(commands) => {
                let mut body = String::from("set -e\n");
                body.push_str(&commands.join("\n"));
                body
            }
            Exec::Script(script) => script.clone(),
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Exec::Commands(commands) => commands.iter().all(|c| c.trim().is_empty()),
            Exec::Script(script) => script.trim().is_empty(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("job has nothing to execute")]
    EmptyExec,
    #[error("job deadline must be positive")]
    ZeroDeadline,
    #[error("job has no container image")]
    EmptyImage,
}

/// Run Descriptor
/// One execution request for a runner. The working directory is the only
/// host path exposed to the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub name: String,
    pub image: String,
    pub work_dir: PathBuf,
    pub env: Vec<(String, String)>,
    pub exec: Exec,
    pub deadline: Duration,
}

impl Job {
    pub fn new(
        name: impl Into<String>,
        image: impl Into<String>,
        work_dir: impl Into<PathBuf>,
        env: Vec<(String, String)>,
        exec: Exec,
        deadline: Duration,
    ) -> Result<Self, JobError> {
        let image = image.into();
        if exec.is_empty() {
            return Err(JobError::EmptyExec);
        }
        if deadline.is_zero() {
            return Err(JobError::ZeroDeadline);
        }
        if image.trim().is_empty() {
            return Err(JobError::EmptyImage);
        }
        Ok(Self {
            name: name.into(),
            image,
            work_dir: work_dir.into(),
            env,
            exec,
            deadline,
        })
    }
}

/// Accepted score record. The secret has already been checked and dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Score {
    pub test_name: String,
    pub score: u32,
    pub max_score: u32,
    pub weight: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInfo {
    /// Test output with every score line removed and the secret redacted
    pub build_log: String,
    pub exec_time: Duration,
}

/// Results of one test run
///
/// ## Semantics:
/// - scores keep the order in which they appeared in the output
/// - scores are integers; weighting is left to downstream grading
/// - produced once per run and handed over to the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Results {
    pub scores: Vec<Score>,
    pub build_info: BuildInfo,
}

impl Results {
    pub fn new(scores: Vec<Score>, build_log: String, exec_time: Duration) -> Self {
        Self {
            scores,
            build_info: BuildInfo {
                build_log,
                exec_time,
            },
        }
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }
}

/// Terminal outcome of a run as reported on the result queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    NoScores,
    SetupFailed,
    ExecutionFailed,
    Cancelled,
}

/// Report written back by the worker for each consumed RunData
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub label: String,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Results>,
}
