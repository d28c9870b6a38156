//! Version-control working copies, one per worker agent.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{bail, Context, Result};

pub trait Worktrees: Send + Sync {
    /// Whether `path` is a usable checkout.
    fn is_repository(&self, path: &Path) -> bool;
    fn create(&self, repo_dir: &Path, path: &Path, branch: &str) -> Result<()>;
    fn remove(&self, repo_dir: &Path, path: &Path, force: bool) -> Result<()>;
    fn prune(&self, repo_dir: &Path) -> Result<()>;
    /// Delete directories under `root` that are neither in `registered` nor a
    /// live worktree of `repo_dir`. Returns what was removed.
    fn cleanup_orphans(
        &self,
        repo_dir: &Path,
        root: &Path,
        registered: &[PathBuf],
    ) -> Result<Vec<PathBuf>>;
}

#[derive(Debug, Default, Clone)]
pub struct GitWorktrees;

fn git(repo_dir: &Path, args: &[&str]) -> Result<Output> {
    Command::new("git")
        .arg("-C")
        .arg(repo_dir)
        .args(args)
        .output()
        .with_context(|| format!("failed to run git {}", args.join(" ")))
}

fn git_ok(repo_dir: &Path, args: &[&str]) -> Result<Output> {
    let output = git(repo_dir, args)?;
    if !output.status.success() {
        bail!(
            "git {} failed in {}: {}",
            args.join(" "),
            repo_dir.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(output)
}

impl GitWorktrees {
    /// Paths of every worktree git currently tracks for `repo_dir`.
    pub fn list(&self, repo_dir: &Path) -> Result<Vec<PathBuf>> {
        let output = git_ok(repo_dir, &["worktree", "list", "--porcelain"])?;
        Ok(parse_worktree_list(&String::from_utf8_lossy(&output.stdout)))
    }
}

impl Worktrees for GitWorktrees {
    fn is_repository(&self, path: &Path) -> bool {
        path.is_dir()
            && git(path, &["rev-parse", "--git-dir"])
                .map(|o| o.status.success())
                .unwrap_or(false)
    }

    fn create(&self, repo_dir: &Path, path: &Path, branch: &str) -> Result<()> {
        let target = path.to_string_lossy();
        if git_ok(repo_dir, &["worktree", "add", "-b", branch, &target]).is_ok() {
            return Ok(());
        }
        // Branch already exists: check it out instead of creating it.
        git_ok(repo_dir, &["worktree", "add", &target, branch])?;
        Ok(())
    }

    fn remove(&self, repo_dir: &Path, path: &Path, force: bool) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }
        let target = path.to_string_lossy();
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(&target);
        git_ok(repo_dir, &args)?;
        Ok(())
    }

    fn prune(&self, repo_dir: &Path) -> Result<()> {
        git_ok(repo_dir, &["worktree", "prune"])?;
        Ok(())
    }

    fn cleanup_orphans(
        &self,
        repo_dir: &Path,
        root: &Path,
        registered: &[PathBuf],
    ) -> Result<Vec<PathBuf>> {
        let live = self.list(repo_dir)?;
        let orphans = find_orphans(root, registered, &live)?;
        let mut removed = Vec::new();
        for dir in orphans {
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => removed.push(dir),
                Err(error) => {
                    tracing::warn!(target = "fleetd::worktree", path = %dir.display(), error = %error, "failed removing orphaned worktree");
                }
            }
        }
        Ok(removed)
    }
}

fn parse_worktree_list(porcelain: &str) -> Vec<PathBuf> {
    porcelain
        .lines()
        .filter_map(|line| line.strip_prefix("worktree "))
        .map(PathBuf::from)
        .collect()
}

fn normalize(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Directories directly under `root` that nobody owns.
pub fn find_orphans(root: &Path, registered: &[PathBuf], live: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(e).with_context(|| format!("failed reading worktree root {}", root.display()))
        }
    };

    let keep: HashSet<PathBuf> = registered
        .iter()
        .chain(live.iter())
        .map(|p| normalize(p))
        .collect();

    let mut orphans = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let path = entry.path();
        if !keep.contains(&normalize(&path)) {
            orphans.push(path);
        }
    }
    orphans.sort();
    Ok(orphans)
}
