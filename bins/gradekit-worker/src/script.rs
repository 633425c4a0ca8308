//! Run Descriptor Builder
//!
//! Turns RunData plus the run's secret and directory into a [`Job`].
//! Script templates are rendered with handlebars in strict mode, so a
//! reference to an unknown field fails the run instead of rendering blank.

use gradekit_common::types::{Exec, Job, JobError, RunData, ASSIGNMENTS_REPO, TESTS_REPO};
use gradekit_common::Config;
use handlebars::{Handlebars, RenderError};
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Environment variable carrying the session secret into the sandbox
pub const SECRET_ENV: &str = "GRADEKIT_SESSION_SECRET";

/// First-line directive naming the container image, e.g. `#image/golang:1.22`
const IMAGE_DIRECTIVE: &str = "#image/";

/// Shared fallback script inside the tests repository
const DEFAULT_SCRIPT_DIR: &str = "scripts";
const SCRIPT_NAME: &str = "run.sh";

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("failed to render run script: {0}")]
    Render(#[from] RenderError),
    #[error("failed to read run script {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("assignment {0} has no run script and no commands")]
    NoExecSpec(String),
    #[error("invalid job: {0}")]
    Job(#[from] JobError),
}

/// Values a run script template may reference
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TemplateFields {
    pub random_secret: String,
    pub course_code: String,
    pub assignment_name: String,
    pub job_owner: String,
    pub repo_name: String,
    pub branch_name: String,
    #[serde(rename = "CommitID")]
    pub commit_id: String,
    pub clone_dir: String,
    pub tests_dir: String,
    pub assignments_dir: String,
    pub submitted_dir: String,
}

impl TemplateFields {
    /// Paths are expressed as the sandbox sees them, rooted at `sandbox_root`.
    pub fn new(run: &RunData, secret: &str, sandbox_root: &Path) -> Self {
        let dir = |name: &str| sandbox_root.join(name).display().to_string();
        Self {
            random_secret: secret.to_string(),
            course_code: run.course.code.clone(),
            assignment_name: run.assignment.name.clone(),
            job_owner: run.job_owner.clone(),
            repo_name: run.repo_name.clone(),
            branch_name: run.branch.clone(),
            commit_id: run.commit_id.clone(),
            clone_dir: sandbox_root.display().to_string(),
            tests_dir: dir(TESTS_REPO),
            assignments_dir: dir(ASSIGNMENTS_REPO),
            submitted_dir: dir(&run.repo_name),
        }
    }

    fn env(&self, run: &RunData) -> Vec<(String, String)> {
        let mut env = vec![
            (SECRET_ENV.to_string(), self.random_secret.clone()),
            ("TESTS".to_string(), self.tests_dir.clone()),
            ("ASSIGNMENTS".to_string(), self.assignments_dir.clone()),
            ("SUBMITTED".to_string(), self.submitted_dir.clone()),
            ("CURRENT".to_string(), self.assignment_name.clone()),
            ("HOME".to_string(), self.clone_dir.clone()),
        ];
        env.extend(run.course.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }
}

/// Render a template against the run fields. Pure; no sandbox needed.
pub fn render(template: &str, fields: &TemplateFields) -> Result<String, ScriptError> {
    let mut handlebars = Handlebars::new();
    handlebars.set_strict_mode(true);
    handlebars.register_escape_fn(handlebars::no_escape);
    Ok(handlebars.render_template(template, fields)?)
}

/// Image named by a leading `#image/` line, if any
pub fn image_directive(script: &str) -> Option<&str> {
    let first = script.lines().next()?.trim();
    first
        .strip_prefix(IMAGE_DIRECTIVE)
        .map(str::trim)
        .filter(|image| !image.is_empty())
}

/// Locate the run script in the tests checkout: assignment-specific first,
/// then the shared default.
fn find_script(work_dir: &Path, assignment: &str) -> Option<PathBuf> {
    let tests = work_dir.join(TESTS_REPO);
    [
        tests.join(assignment).join(SCRIPT_NAME),
        tests.join(DEFAULT_SCRIPT_DIR).join(SCRIPT_NAME),
    ]
    .into_iter()
    .find(|path| path.is_file())
}

/// Build the job for one run.
///
/// ## Arguments
/// * `work_dir` - host directory holding the clones
/// * `sandbox_root` - where `work_dir` appears inside the sandbox
pub fn build_job(
    run: &RunData,
    secret: &str,
    work_dir: &Path,
    sandbox_root: &Path,
    config: &Config,
) -> Result<Job, ScriptError> {
    let fields = TemplateFields::new(run, secret, sandbox_root);

    let template = match &run.assignment.script_template {
        Some(inline) => Some(inline.clone()),
        None => match find_script(work_dir, &run.assignment.name) {
            Some(path) => Some(
                std::fs::read_to_string(&path)
                    .map_err(|source| ScriptError::Read { path, source })?,
            ),
            None => None,
        },
    };

    let (exec, script_image) = match template {
        Some(template) => {
            let script = render(&template, &fields)?;
            let image = image_directive(&script).map(str::to_string);
            (Exec::Script(script), image)
        }
        None if !run.assignment.commands.is_empty() => {
            let commands = run
                .assignment
                .commands
                .iter()
                .map(|cmd| render(cmd, &fields))
                .collect::<Result<Vec<_>, _>>()?;
            (Exec::Commands(commands), None)
        }
        None => return Err(ScriptError::NoExecSpec(run.assignment.name.clone())),
    };

    let image = script_image
        .or_else(|| run.course.image.clone())
        .unwrap_or_else(|| config.default_image.clone());

    Ok(Job::new(
        run.label(),
        image,
        work_dir,
        fields.env(run),
        exec,
        config.deadline(run.assignment.container_timeout_ms),
    )?)
}
