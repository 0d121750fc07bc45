use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::Result;
use log::{debug, info};

use crate::error::{BackendError, ConfigError};

pub const DEFAULT_GIT: &str = "git";

/// One commit: the staged paths plus authorship.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Changeset {
    pub paths: Vec<String>,
    pub author: String,
    pub date: String,
    pub message: String,
}

pub trait VersionedHistory {
    fn commit(&mut self, changeset: &Changeset) -> Result<(), BackendError>;

    /// Drops commits that ended up with no changes.
    fn prune_empty(&mut self) -> Result<(), BackendError>;
}

pub struct GitBackend {
    program: String,
    workdir: PathBuf,
    start: Option<String>,
}

impl GitBackend {
    /// Opens the working tree at `workdir`, remembering the commit replay starts from.
    pub fn open(program: &str, workdir: &Path) -> Result<Self> {
        if !workdir.join(".git").exists() {
            return Err(ConfigError::NotARepository(workdir.to_path_buf()).into());
        }
        let mut backend = Self {
            program: program.to_string(),
            workdir: workdir.to_path_buf(),
            start: None,
        };
        backend.start = backend
            .run_git(&["rev-parse", "--verify", "--quiet", "HEAD"], None, &[])
            .ok()
            .filter(|head| !head.is_empty());
        debug!(
            "git backend at {} starting from {}",
            workdir.display(),
            backend.start.as_deref().unwrap_or("an unborn branch")
        );
        Ok(backend)
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    fn run_git(
        &self,
        args: &[&str],
        stdin: Option<&str>,
        envs: &[(&str, &str)],
    ) -> Result<String, BackendError> {
        let command = format!("{} {}", self.program, args.join(" "));
        let mut child = Command::new(&self.program)
            .args(args)
            .envs(envs.iter().copied())
            .current_dir(&self.workdir)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| BackendError::Launch {
                command: command.clone(),
                source,
            })?;

        if let Some(input) = stdin
            && let Some(mut pipe) = child.stdin.take()
        {
            pipe.write_all(input.as_bytes())
                .map_err(|source| BackendError::Launch {
                    command: command.clone(),
                    source,
                })?;
        }

        let output = child
            .wait_with_output()
            .map_err(|source| BackendError::Launch {
                command: command.clone(),
                source,
            })?;
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !output.status.success() {
            return Err(BackendError::Command {
                command,
                status: output.status.code().unwrap_or(1),
                stdout,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(stdout)
    }
}

impl VersionedHistory for GitBackend {
    fn commit(&mut self, changeset: &Changeset) -> Result<(), BackendError> {
        let mut add = vec!["add", "--"];
        add.extend(changeset.paths.iter().map(String::as_str));
        self.run_git(&add, None, &[])?;

        let mut commit = vec![
            "commit",
            "--date",
            changeset.date.as_str(),
            "--author",
            changeset.author.as_str(),
            "-F",
            "-",
            "--allow-empty",
            "--",
        ];
        commit.extend(changeset.paths.iter().map(String::as_str));
        self.run_git(&commit, Some(&changeset.message), &[])?;
        Ok(())
    }

    fn prune_empty(&mut self) -> Result<(), BackendError> {
        let range = match &self.start {
            Some(start) => format!("{start}..HEAD"),
            None => "HEAD".to_string(),
        };
        info!("pruning empty commits in {range}");
        self.run_git(
            &["filter-branch", "--force", "--prune-empty", &range],
            None,
            &[("FILTER_BRANCH_SQUELCH_WARNING", "1")],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;
    use std::process::Command;

    use tempfile::tempdir;

    use super::{Changeset, GitBackend, VersionedHistory};
    use crate::error::{BackendError, ConfigError};

    fn git_available() -> bool {
        Command::new("git")
            .arg("--version")
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    fn git(workdir: &Path, args: &[&str]) -> String {
        let output = Command::new("git")
            .args(args)
            .current_dir(workdir)
            .output()
            .expect("run git");
        assert!(output.status.success(), "git {args:?} failed");
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    fn init_repo(workdir: &Path) {
        git(workdir, &["init", "--quiet"]);
        git(workdir, &["config", "user.name", "Replay Tester"]);
        git(workdir, &["config", "user.email", "tester@example.org"]);
    }

    #[test]
    fn open_requires_a_repository() {
        let temp = tempdir().expect("tempdir");
        let error = GitBackend::open("git", temp.path())
            .err()
            .expect("must fail");
        assert!(matches!(
            error.downcast_ref::<ConfigError>(),
            Some(ConfigError::NotARepository(_))
        ));
    }

    #[test]
    fn commit_records_author_date_and_message() {
        if !git_available() {
            return;
        }
        let temp = tempdir().expect("tempdir");
        init_repo(temp.path());
        fs::create_dir_all(temp.path().join("wiki")).expect("create prefix");
        fs::write(temp.path().join("wiki/Home.mediawiki"), "Hello").expect("write page");

        let mut backend = GitBackend::open("git", temp.path()).expect("open");
        backend
            .commit(&Changeset {
                paths: vec!["wiki/Home.mediawiki".to_string()],
                author: "Alice <alice@example.org>".to_string(),
                date: "2010-01-01T10:00:00Z".to_string(),
                message: "first \"quoted\" edit".to_string(),
            })
            .expect("commit");
        backend
            .commit(&Changeset {
                paths: vec!["wiki/Home.mediawiki".to_string()],
                author: "Bob <bob@example.org>".to_string(),
                date: "2010-02-01T10:00:00Z".to_string(),
                message: "nothing changed".to_string(),
            })
            .expect("empty commit");

        let log = git(temp.path(), &["log", "--format=%an|%aI|%s"]);
        let lines = log.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "Bob|2010-02-01T10:00:00+00:00|nothing changed");
        assert_eq!(lines[1], "Alice|2010-01-01T10:00:00+00:00|first \"quoted\" edit");

        backend.prune_empty().expect("prune");
        let pruned = git(temp.path(), &["log", "--format=%s"]);
        assert_eq!(pruned, "first \"quoted\" edit");
    }

    #[test]
    fn failed_command_carries_status_and_output() {
        if !git_available() {
            return;
        }
        let temp = tempdir().expect("tempdir");
        init_repo(temp.path());
        let mut backend = GitBackend::open("git", temp.path()).expect("open");
        let error = backend
            .commit(&Changeset {
                paths: vec!["missing.md".to_string()],
                author: "Alice <alice@example.org>".to_string(),
                date: "2010-01-01T10:00:00Z".to_string(),
                message: "nope".to_string(),
            })
            .expect_err("must fail");
        match error {
            BackendError::Command {
                command, stderr, ..
            } => {
                assert!(command.starts_with("git add -- missing.md"));
                assert!(!stderr.is_empty());
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
