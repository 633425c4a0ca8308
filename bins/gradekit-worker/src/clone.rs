//! Repository Fetcher
//!
//! Clones the submission and the course's shared repositories into the
//! per-run directory. The source-control provider itself stays behind the
//! [`Scm`] trait; [`GitCli`] is a thin adapter over the `git` binary.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum CloneError {
    #[error("failed to clone {repository}: {reason}")]
    Failed { repository: String, reason: String },
    #[error("repository {0} is empty")]
    EmptyRepository(String),
    #[error("cloning cancelled")]
    Cancelled,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneOptions {
    pub organization: String,
    pub repository: String,
    pub dest_dir: PathBuf,
    /// Default branch when `None`
    pub branch: Option<String>,
}

/// Source-control client consumed by the pipeline
#[async_trait]
pub trait Scm: Send + Sync {
    /// Clone into `dest_dir/<repository>` and return that path.
    async fn clone_repo(&self, opts: &CloneOptions) -> Result<PathBuf, CloneError>;

    async fn repository_is_empty(&self, organization: &str, repository: &str) -> bool;
}

/// One repository to fetch for a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoInfo {
    pub repo: String,
    pub branch: Option<String>,
}

impl RepoInfo {
    pub fn new(repo: impl Into<String>, branch: Option<String>) -> Self {
        Self {
            repo: repo.into(),
            branch,
        }
    }
}

/// Clone every repository into `dest_dir`, in order.
///
/// The first repository is the submission; it must not be empty. Any failure
/// aborts the whole fetch and leaves cleanup of `dest_dir` to its owner.
pub async fn clone_repositories(
    scm: &dyn Scm,
    organization: &str,
    repos: &[RepoInfo],
    dest_dir: &Path,
    cancel: &CancellationToken,
) -> Result<Vec<PathBuf>, CloneError> {
    let mut cloned = Vec::with_capacity(repos.len());

    for (idx, info) in repos.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(CloneError::Cancelled);
        }
        if idx == 0 {
            let empty = tokio::select! {
                _ = cancel.cancelled() => return Err(CloneError::Cancelled),
                empty = scm.repository_is_empty(organization, &info.repo) => empty,
            };
            if empty {
                return Err(CloneError::EmptyRepository(info.repo.clone()));
            }
        }

        let opts = CloneOptions {
            organization: organization.to_string(),
            repository: info.repo.clone(),
            dest_dir: dest_dir.to_path_buf(),
            branch: info.branch.clone(),
        };
        tracing::debug!(repository = %info.repo, branch = ?info.branch, "Cloning repository");

        let path = tokio::select! {
            _ = cancel.cancelled() => return Err(CloneError::Cancelled),
            result = scm.clone_repo(&opts) => result?,
        };
        cloned.push(path);
    }

    Ok(cloned)
}

/// Clones over HTTPS with the `git` command line client
pub struct GitCli {
    base_url: String,
}

impl GitCli {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn clone_url(&self, organization: &str, repository: &str) -> String {
        format!("{}/{}/{}.git", self.base_url, organization, repository)
    }
}

#[async_trait]
impl Scm for GitCli {
    async fn clone_repo(&self, opts: &CloneOptions) -> Result<PathBuf, CloneError> {
        let target = opts.dest_dir.join(&opts.repository);
        let mut cmd = Command::new("git");
        cmd.arg("clone").arg("--depth").arg("1");
        if let Some(branch) = &opts.branch {
            cmd.arg("--branch").arg(branch);
        }
        cmd.arg(self.clone_url(&opts.organization, &opts.repository))
            .arg(&target)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = cmd.output().await?;
        if !output.status.success() {
            return Err(CloneError::Failed {
                repository: opts.repository.clone(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(target)
    }

    async fn repository_is_empty(&self, organization: &str, repository: &str) -> bool {
        let output = Command::new("git")
            .arg("ls-remote")
            .arg("--heads")
            .arg(self.clone_url(organization, repository))
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await;
        // Unreachable repositories are not reported as empty; the clone
        // that follows produces the real error.
        match output {
            Ok(out) if out.status.success() => out.stdout.iter().all(u8::is_ascii_whitespace),
            _ => false,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    /// Fake provider that materializes repositories from in-memory file trees
    #[derive(Default)]
    pub(crate) struct FakeScm {
        pub(crate) repos: HashMap<String, Vec<(String, String)>>,
        pub(crate) empty: Vec<String>,
        pub(crate) failing: Vec<String>,
        pub(crate) links: HashMap<String, Vec<(String, String)>>,
        pub(crate) clone_dirs: Mutex<Vec<PathBuf>>,
    }

    impl FakeScm {
        pub(crate) fn with_repo(mut self, name: &str, files: &[(&str, &str)]) -> Self {
            let files = files
                .iter()
                .map(|(p, c)| (p.to_string(), c.to_string()))
                .collect();
            self.repos.insert(name.to_string(), files);
            self
        }

        pub(crate) fn with_symlink(mut self, name: &str, link: &str, target: &str) -> Self {
            self.links
                .entry(name.to_string())
                .or_default()
                .push((link.to_string(), target.to_string()));
            self
        }
    }

    #[async_trait]
    impl Scm for FakeScm {
        async fn clone_repo(&self, opts: &CloneOptions) -> Result<PathBuf, CloneError> {
            self.clone_dirs.lock().unwrap().push(opts.dest_dir.clone());
            if self.failing.contains(&opts.repository) {
                return Err(CloneError::Failed {
                    repository: opts.repository.clone(),
                    reason: "remote hung up".to_string(),
                });
            }
            let files = self.repos.get(&opts.repository).ok_or_else(|| CloneError::Failed {
                repository: opts.repository.clone(),
                reason: "not found".to_string(),
            })?;
            let target = opts.dest_dir.join(&opts.repository);
            std::fs::create_dir_all(&target)?;
            for (path, content) in files {
                let file = target.join(path);
                if let Some(parent) = file.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(file, content)?;
            }
            for (link, dest) in self.links.get(&opts.repository).into_iter().flatten() {
                std::os::unix::fs::symlink(dest, target.join(link))?;
            }
            Ok(target)
        }

        async fn repository_is_empty(&self, _organization: &str, repository: &str) -> bool {
            self.empty.iter().any(|r| r == repository)
        }
    }

    fn repos() -> Vec<RepoInfo> {
        vec![
            RepoInfo::new("alice-labs", Some("main".to_string())),
            RepoInfo::new("tests", None),
        ]
    }

    #[tokio::test]
    async fn test_clone_all_repositories() {
        let scm = FakeScm::default()
            .with_repo("alice-labs", &[("lab1/main.go", "package main")])
            .with_repo("tests", &[("lab1/run.sh", "echo ok")]);
        let dir = tempfile::tempdir().unwrap();

        let paths = clone_repositories(&scm, "dat320", &repos(), dir.path(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(paths, vec![dir.path().join("alice-labs"), dir.path().join("tests")]);
        assert!(dir.path().join("tests/lab1/run.sh").is_file());
    }

    #[tokio::test]
    async fn test_empty_submission_rejected() {
        let mut scm = FakeScm::default().with_repo("alice-labs", &[]);
        scm.empty.push("alice-labs".to_string());
        let dir = tempfile::tempdir().unwrap();

        let err = clone_repositories(&scm, "dat320", &repos(), dir.path(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_matches!(err, CloneError::EmptyRepository(repo) if repo == "alice-labs");
    }

    #[tokio::test]
    async fn test_clone_failure_aborts() {
        let mut scm = FakeScm::default().with_repo("alice-labs", &[("a.txt", "a")]);
        scm.failing.push("tests".to_string());
        let dir = tempfile::tempdir().unwrap();

        let err = clone_repositories(&scm, "dat320", &repos(), dir.path(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_matches!(err, CloneError::Failed { repository, .. } if repository == "tests");
    }

    #[tokio::test]
    async fn test_cancelled_before_clone() {
        let scm = FakeScm::default().with_repo("alice-labs", &[]);
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = clone_repositories(&scm, "dat320", &repos(), dir.path(), &cancel)
            .await
            .unwrap_err();
        assert_matches!(err, CloneError::Cancelled);
        assert!(scm.clone_dirs.lock().unwrap().is_empty());
    }

    /// Provider whose emptiness check never answers in time
    struct StalledScm;

    #[async_trait]
    impl Scm for StalledScm {
        async fn clone_repo(&self, opts: &CloneOptions) -> Result<PathBuf, CloneError> {
            Ok(opts.dest_dir.join(&opts.repository))
        }

        async fn repository_is_empty(&self, _organization: &str, _repository: &str) -> bool {
            tokio::time::sleep(Duration::from_secs(5)).await;
            false
        }
    }

    #[tokio::test]
    async fn test_cancel_interrupts_empty_check() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = clone_repositories(&StalledScm, "dat320", &repos(), dir.path(), &cancel)
            .await
            .unwrap_err();

        assert_matches!(err, CloneError::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_git_clone_url() {
        let git = GitCli::new("https://github.com/");
        assert_eq!(
            git.clone_url("dat320-2026", "tests"),
            "https://github.com/dat320-2026/tests.git"
        );
    }
}
