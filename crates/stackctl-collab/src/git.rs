use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Result, bail};

use crate::traits::GitChangeSource;

fn git_program() -> &'static str {
    "git"
}

/// A [`GitChangeSource`] that shells out to the `git` binary, mirroring how
/// the rest of this workspace treats external processes (see
/// `stackctl-plan`'s universe loader for the filesystem-walking half of the
/// same idea).
#[derive(Debug, Clone, Default)]
pub struct ShellGit;

impl GitChangeSource for ShellGit {
    fn changed_files(&self, root_dir: &Path, range: &str) -> Result<Vec<PathBuf>> {
        let output = Command::new(git_program())
            .arg("diff")
            .arg("--name-only")
            .arg(range)
            .current_dir(root_dir)
            .output()?;

        if !output.status.success() {
            bail!(
                "git diff --name-only {range} failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|line| root_dir.join(line.trim()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;

    fn run(dir: &Path, args: &[&str]) {
        let status = StdCommand::new("git")
            .args(args)
            .current_dir(dir)
            .status()
            .expect("git available");
        assert!(status.success(), "git {:?} failed", args);
    }

    #[test]
    fn changed_files_reports_files_touched_in_a_range() {
        let td = tempfile::tempdir().unwrap();
        let dir = td.path();
        run(dir, &["init", "-q"]);
        run(dir, &["config", "user.email", "a@example.com"]);
        run(dir, &["config", "user.name", "a"]);
        std::fs::write(dir.join("a.txt"), "1").unwrap();
        run(dir, &["add", "."]);
        run(dir, &["commit", "-q", "-m", "one"]);
        std::fs::write(dir.join("b.txt"), "2").unwrap();
        run(dir, &["add", "."]);
        run(dir, &["commit", "-q", "-m", "two"]);

        let git = ShellGit;
        let changed = git.changed_files(dir, "HEAD~1..HEAD").unwrap();
        assert_eq!(changed, vec![dir.join("b.txt")]);
    }
}
