//! Student repository scan.
//!
//! Runs after cloning and before anything executes. The run directory is
//! bind-mounted into the sandbox, so an entry that points outside of it, or
//! into the tests checkout next to it, must never reach the runner.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("symbolic link not allowed in submission: {0}")]
    Symlink(PathBuf),
    #[error("special file not allowed in submission: {0}")]
    SpecialFile(PathBuf),
    #[error("failed to scan {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Walk the student checkout and reject anything that is not a plain file
/// or directory. Paths in errors are relative to `repo_dir`.
pub fn scan_student_repo(repo_dir: &Path) -> Result<(), ScanError> {
    scan_dir(repo_dir, repo_dir)
}

fn scan_dir(root: &Path, dir: &Path) -> Result<(), ScanError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| ScanError::Io { path, source }
    };

    for entry in fs::read_dir(dir).map_err(io_err(dir))? {
        let entry = entry.map_err(io_err(dir))?;
        let path = entry.path();
        // symlink_metadata does not follow links
        let meta = fs::symlink_metadata(&path).map_err(io_err(&path))?;
        let relative = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
        let file_type = meta.file_type();

        if file_type.is_symlink() {
            return Err(ScanError::Symlink(relative));
        }
        if file_type.is_dir() {
            // .git is written by the clone itself, not by the student
            if dir == root && entry.file_name() == ".git" {
                continue;
            }
            scan_dir(root, &path)?;
        } else if !file_type.is_file() {
            return Err(ScanError::SpecialFile(relative));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_clean_repo_passes() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("lab1/sub")).unwrap();
        fs::write(dir.path().join("lab1/main.go"), "package main").unwrap();
        fs::write(dir.path().join("lab1/sub/util.go"), "package sub").unwrap();
        fs::write(dir.path().join("README.md"), "# labs").unwrap();

        assert!(scan_student_repo(dir.path()).is_ok());
    }

    #[test]
    fn test_symlink_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("lab1")).unwrap();
        std::os::unix::fs::symlink("/etc/passwd", dir.path().join("lab1/passwd")).unwrap();

        let err = scan_student_repo(dir.path()).unwrap_err();
        assert_matches!(err, ScanError::Symlink(path) if path == Path::new("lab1/passwd"));
    }

    #[test]
    fn test_dangling_symlink_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink("../tests", dir.path().join("tests")).unwrap();

        assert_matches!(scan_student_repo(dir.path()), Err(ScanError::Symlink(_)));
    }

    #[test]
    fn test_git_dir_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::os::unix::fs::symlink("objects", dir.path().join(".git/alias")).unwrap();

        assert!(scan_student_repo(dir.path()).is_ok());
    }

    #[test]
    fn test_missing_repo_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");

        assert_matches!(scan_student_repo(&missing), Err(ScanError::Io { .. }));
    }
}
