//! A narrow wrapper around a local working tree's git plumbing, used by
//! the dispatcher instead of a git-object library — every operation here
//! shells out to the `git` binary already present on any CI runner.
//!
//! The dispatcher depends on this crate's public surface, not on
//! `std::process::Command` directly, so tests can swap in a fixture
//! repository without mocking the shell.

use std::path::{Path, PathBuf};
use std::process::Command;

use gitops_promotion_types::{Error, Result};

/// Branch prefix every promotion PR's branch starts with; used by
/// `status` to tell a promotion-generated branch from a manually pushed
/// one.
pub const PROMOTE_BRANCH_PREFIX: &str = "promote/";

/// A handle onto a single local working tree.
#[derive(Debug, Clone)]
pub struct Repository {
    root: PathBuf,
}

fn run(root: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .current_dir(root)
        .args(args)
        .output()?;
    if !output.status.success() {
        return Err(Error::Permanent(format!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

impl Repository {
    /// Opens an existing working tree at `root`. Does not clone or
    /// initialize anything; the caller owns the lifetime of `root`
    /// (typically a scoped temporary directory).
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Repository { root: root.into() }
    }

    pub fn root_dir(&self) -> &Path {
        &self.root
    }

    pub fn is_clean(&self) -> Result<bool> {
        let status = run(&self.root, &["status", "--porcelain"])?;
        Ok(status.is_empty())
    }

    pub fn ensure_clean(&self) -> Result<()> {
        if !self.is_clean()? {
            return Err(Error::Permanent(
                "working tree has uncommitted changes".to_string(),
            ));
        }
        Ok(())
    }

    pub fn current_commit(&self) -> Result<String> {
        run(&self.root, &["rev-parse", "HEAD"])
    }

    /// Resolves an arbitrary ref (e.g. `origin/main`) to a commit sha,
    /// used by the status poll to re-anchor on the default branch's
    /// current head when a status lookup against the original commit
    /// races a merge.
    pub fn rev_parse(&self, refname: &str) -> Result<String> {
        run(&self.root, &["rev-parse", refname])
    }

    /// `None` when the tree is in detached-HEAD state, which is normal
    /// inside CI pipelines that check out a specific commit.
    pub fn current_branch(&self) -> Result<Option<String>> {
        let name = run(&self.root, &["symbolic-ref", "--short", "-q", "HEAD"]);
        match name {
            Ok(n) if !n.is_empty() => Ok(Some(n)),
            _ => Ok(None),
        }
    }

    /// The remote's default branch, read from `origin/HEAD`.
    pub fn default_branch(&self) -> Result<String> {
        let symref = run(&self.root, &["symbolic-ref", "refs/remotes/origin/HEAD"])?;
        symref
            .rsplit('/')
            .next()
            .map(str::to_string)
            .ok_or_else(|| Error::Permanent(format!("unexpected symref format: {symref:?}")))
    }

    /// Creates `name` at the current HEAD. When `reset_if_exists` is set
    /// and the branch already exists, it is force-reset to HEAD instead
    /// of failing — this is how the per-env flow reuses a promotion
    /// branch across invocations (§9: relies on the provider updating
    /// the existing PR rather than opening a new one).
    pub fn create_branch(&self, name: &str, reset_if_exists: bool) -> Result<()> {
        if reset_if_exists {
            run(&self.root, &["checkout", "-B", name])?;
        } else {
            run(&self.root, &["checkout", "-b", name])?;
        }
        Ok(())
    }

    /// Stages every change (including deletions) and commits, returning
    /// the new commit sha. An empty commit (no changes staged) is
    /// permitted, not an error — the caller may be re-running a
    /// promotion whose image tag was already current.
    pub fn commit_all(&self, branch: &str, message: &str) -> Result<String> {
        run(&self.root, &["checkout", branch])?;
        run(&self.root, &["add", "-A"])?;
        let commit = Command::new("git")
            .current_dir(&self.root)
            .args(["commit", "--allow-empty", "-m", message])
            .output()?;
        if !commit.status.success() {
            return Err(Error::Permanent(format!(
                "git commit failed: {}",
                String::from_utf8_lossy(&commit.stderr).trim()
            )));
        }
        self.current_commit()
    }

    pub fn push(&self, branch: &str, force: bool) -> Result<()> {
        if force {
            run(&self.root, &["push", "--force", "origin", branch])?;
        } else {
            run(&self.root, &["push", "origin", branch])?;
        }
        Ok(())
    }

    /// Files touched since `since` (a commit-ish), used by
    /// `feature-delete-stale` to avoid re-walking the full commit graph.
    pub fn changed_files(&self, since: &str) -> Result<Vec<PathBuf>> {
        let out = run(&self.root, &["diff", "--name-only", since, "HEAD"])?;
        Ok(out.lines().map(PathBuf::from).collect())
    }

    /// The most recent commit on `HEAD` whose author date is at or before
    /// `unix_secs`, or `None` if the entire history postdates it. Used by
    /// `feature-delete-stale` to anchor [`Self::changed_files`] at the
    /// `max_age` cutoff.
    pub fn commit_before(&self, unix_secs: i64) -> Result<Option<String>> {
        let out = run(
            &self.root,
            &["log", "-1", "--format=%H", &format!("--until={unix_secs}")],
        )?;
        Ok(if out.is_empty() { None } else { Some(out) })
    }

    /// The author timestamp (Unix seconds) of the last commit touching
    /// `path`, used to age out stale feature deployments.
    pub fn last_commit_timestamp(&self, path: &Path) -> Result<i64> {
        let rel = path
            .strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .to_string();
        let out = run(
            &self.root,
            &["log", "-1", "--format=%at", "--", rel.as_str()],
        )?;
        out.parse::<i64>()
            .map_err(|e| Error::Permanent(format!("could not parse commit timestamp: {e}")))
    }
}
