//! The promotion state machine. [`Dispatcher`] composes a loaded
//! [`Configuration`], a local [`Repository`], and a [`GitProvider`] into
//! the four verbs a CLI invocation drives: `new`, `promote`, `status`,
//! and the feature sub-commands.
//!
//! Every verb returns a human-readable success message or a typed
//! [`Error`] — there is no partial-success state; a verb either fully
//! completes its branch/commit/push/PR sequence or leaves the working
//! tree exactly as it found it plus whatever local commits it already
//! made (a re-run is always safe, since branches are reset rather than
//! appended to).

use std::path::Path;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use gitops_promotion_git::{Repository, PROMOTE_BRANCH_PREFIX};
use gitops_promotion_provider::GitProvider;
use gitops_promotion_retry::CancelFlag;
use gitops_promotion_types::{sanitize_feature_name, Error, PRState, PRType, PrFlow, Configuration, Result};

/// Branch the aggregate `feature-delete-stale` cleanup PR lives on.
const FEATURE_CLEANUP_BRANCH: &str = "promote/feature-cleanup";

/// Interval between status-poll rounds, matching the documented 5-second
/// cadence.
const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(5);

pub struct Dispatcher {
    config: Configuration,
    repo: Repository,
    provider: Box<dyn GitProvider>,
    cancel: CancelFlag,
}

impl Dispatcher {
    pub fn new(
        config: Configuration,
        repo: Repository,
        provider: Box<dyn GitProvider>,
        cancel: CancelFlag,
    ) -> Self {
        Dispatcher { config, repo, provider, cancel }
    }

    /// `new(group, app, tag)`: seeds a fresh [`PRState`] at the first
    /// environment and runs the shared promote-step sequence.
    pub fn promote_new(&self, group: &str, app: &str, tag: &str) -> Result<String> {
        if group.is_empty() || app.is_empty() {
            return Err(Error::InvalidConfig(
                "group and app must be non-empty".to_string(),
            ));
        }
        let state = PRState {
            group: group.to_string(),
            app: app.to_string(),
            tag: tag.to_string(),
            env: self.config.first_environment().name.clone(),
            sha: self.repo.current_commit()?,
            feature: None,
            pr_type: PRType::Promote,
        };
        self.promote_step(state)
    }

    /// `promote()`: advances the promotion that produced the commit at
    /// HEAD to its next environment.
    pub fn promote(&self) -> Result<String> {
        let sha = self.repo.current_commit()?;
        let pr = match self.provider.get_pr_that_caused_commit(&sha) {
            Ok(pr) => pr,
            Err(Error::NotFound(_)) => {
                return Ok("skipping promotion as commit does not originate from PR".to_string())
            }
            Err(e) => return Err(e),
        };
        let Some(state) = pr.state else {
            return Ok("skipping promotion as PR is not created by gitops-promotion".to_string());
        };
        if state.pr_type == PRType::Feature {
            return Ok("skipping promotion of feature".to_string());
        }
        if !self.config.has_next(&state.env)? {
            return Ok("no next environment to promote to".to_string());
        }
        let next_env = self.config.next(&state.env)?.name.clone();
        let advanced = PRState {
            env: next_env,
            sha,
            ..state
        };
        self.promote_step(advanced)
    }

    fn promote_step(&self, state: PRState) -> Result<String> {
        let env_dir = self.repo.root_dir().join(&state.group).join(&state.env);
        gitops_promotion_manifest::update_image_tag(&env_dir, &state.app, &state.group, &state.tag)?;
        self.finalize_and_open_pr(&state, true)
    }

    /// `status()`: the CI-invoked gate that blocks a promotion PR from
    /// merging until the previous environment reports success.
    pub fn status(&self) -> Result<String> {
        let Some(branch) = self.repo.current_branch()? else {
            return Ok("Promotion was manual, skipping check".to_string());
        };
        if !branch.starts_with(PROMOTE_BRANCH_PREFIX) {
            return Ok("Promotion was manual, skipping check".to_string());
        }

        let default_branch = self.repo.default_branch()?;
        let pr = self.provider.get_pr_with_branch(&branch, &default_branch)?;
        let Some(state) = pr.state else {
            return Err(Error::Permanent(
                "pull request was not created by gitops-promotion".to_string(),
            ));
        };
        if state.pr_type == PRType::Feature {
            return Ok("Automatically allowing feature branch PR".to_string());
        }
        if state.env == self.config.first_environment().name {
            return Ok(format!(
                "{:?} is the first environment so status check is skipped",
                state.env
            ));
        }

        let prev_env = self.config.prev(&state.env)?.name.clone();
        self.poll_previous_environment(&state, &prev_env, &default_branch)
    }

    fn poll_previous_environment(
        &self,
        state: &PRState,
        prev_env: &str,
        default_branch: &str,
    ) -> Result<String> {
        let deadline = Instant::now() + self.config.status_timeout();
        let mut query_sha = state.sha.clone();
        loop {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match self.provider.get_status(&query_sha, &state.group, prev_env) {
                Ok(status) if status.succeeded => {
                    return Ok(format!(
                        "status check has succeed for environment {prev_env}"
                    ))
                }
                Ok(_) => {
                    return Err(Error::StatusFailed(format!(
                        "environment {prev_env} reported a failed status for commit {query_sha}"
                    )))
                }
                Err(e) => {
                    warn!(error = %e, prev_env, "status not yet published, will retry");
                    // The status may have been published against the
                    // default branch's merge commit rather than the PR's
                    // source sha; re-anchor and try again next round.
                    if let Ok(head) = self
                        .repo
                        .rev_parse(&format!("origin/{default_branch}"))
                    {
                        query_sha = head;
                    }
                }
            }

            if Instant::now() >= deadline {
                return Err(Error::StatusTimeout(format!(
                    "timed out waiting for environment {prev_env} to report status"
                )));
            }
            std::thread::sleep(STATUS_POLL_INTERVAL);
        }
    }

    /// `feature(group, app, tag, feature)`: forks a temporary review
    /// deployment of `app` at the first environment.
    pub fn feature_new(&self, group: &str, app: &str, tag: &str, feature: &str) -> Result<String> {
        let sanitized = sanitize_feature_name(feature)?;
        let first_env = self.config.first_environment().name.clone();
        let state = PRState {
            group: group.to_string(),
            app: app.to_string(),
            tag: tag.to_string(),
            env: first_env,
            sha: self.repo.current_commit()?,
            feature: Some(sanitized.clone()),
            pr_type: PRType::Feature,
        };

        let label_selector = self.config.feature_label_selector(group, app)?.clone();
        gitops_promotion_manifest::duplicate_application(
            self.repo.root_dir(),
            group,
            &state.env,
            app,
            tag,
            &sanitized,
            &label_selector,
        )?;
        self.finalize_and_open_pr(&state, false)
    }

    /// `feature-delete-stale(max_age)`: removes feature deployments whose
    /// manifests have not changed in `max_age` and, if any were removed,
    /// opens one aggregate cleanup pull request.
    pub fn feature_delete_stale(&self, max_age: Duration) -> Result<String> {
        let first_env = self.config.first_environment().name.clone();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        let cutoff = now - max_age.as_secs() as i64;

        // Bounds the per-directory timestamp lookups below to real commit
        // history: a directory absent from the diff against the cutoff
        // commit hasn't changed since before the cutoff and is
        // unambiguously stale without needing its exact timestamp. If the
        // whole history postdates the cutoff, nothing can be `max_age` old.
        let Some(cutoff_commit) = self.repo.commit_before(cutoff)? else {
            return Ok("no stale feature deployments found".to_string());
        };
        let touched_since_cutoff: std::collections::HashSet<_> =
            self.repo.changed_files(&cutoff_commit)?.into_iter().collect();

        let mut removed = Vec::new();
        for (group, app) in self.config.all_apps() {
            let env_dir = self.repo.root_dir().join(group).join(&first_env);
            let Ok(read_dir) = std::fs::read_dir(&env_dir) else {
                continue;
            };
            let prefix = format!("{app}-");
            for entry in read_dir {
                let entry = entry?;
                let path = entry.path();
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if !path.is_dir() || !name.starts_with(&prefix) {
                    continue;
                }
                let feature = &name[prefix.len()..];

                let rel = path.strip_prefix(self.repo.root_dir()).unwrap_or(&path);
                let touched_recently = touched_since_cutoff.iter().any(|p: &std::path::PathBuf| p.starts_with(rel));
                if touched_recently {
                    let age_secs = now - self.repo.last_commit_timestamp(&path)?;
                    if age_secs <= max_age.as_secs() as i64 {
                        continue;
                    }
                }
                removed.push((group.to_string(), app.to_string(), feature.to_string()));
            }
        }

        if removed.is_empty() {
            return Ok("no stale feature deployments found".to_string());
        }

        for (group, app, feature) in &removed {
            gitops_promotion_manifest::remove_application(
                self.repo.root_dir(),
                group,
                &first_env,
                app,
                feature,
            )?;
        }

        self.repo.create_branch(FEATURE_CLEANUP_BRANCH, true)?;
        let sha = self
            .repo
            .commit_all(FEATURE_CLEANUP_BRANCH, "Remove stale review features")?;
        self.repo.push(FEATURE_CLEANUP_BRANCH, true)?;
        let id = self.provider.create_or_update_pr(
            FEATURE_CLEANUP_BRANCH,
            false,
            "Remove stale review features",
            &format!("Removed {} stale feature deployment(s).", removed.len()),
        )?;
        info!(count = removed.len(), pr = id, "opened stale-feature cleanup PR");
        Ok(format!(
            "created branch {FEATURE_CLEANUP_BRANCH} with pull request {id} removing {} stale feature deployment(s) on commit {sha}",
            removed.len()
        ))
    }

    fn finalize_and_open_pr(&self, state: &PRState, reset_if_exists: bool) -> Result<String> {
        let include_env = self.config.pr_flow() == PrFlow::PerEnv;
        let branch = state.branch_name(include_env);
        self.repo.create_branch(&branch, reset_if_exists)?;
        let sha = self.repo.commit_all(&branch, &state.title())?;
        self.repo.push(&branch, true)?;
        let auto = self.config.is_automated(&state.env)?;
        let id = self
            .provider
            .create_or_update_pr(&branch, auto, &state.title(), &state.encode()?)?;
        Ok(format!(
            "created branch {branch} with pull request {id} on commit {sha}"
        ))
    }
}

/// Loads the policy file adjacent to (or above) `start_dir`. Kept here,
/// rather than only in `gitops-promotion-config`, so the CLI front-end
/// has a single entry point for wiring up a [`Dispatcher`].
pub fn load_configuration(start_dir: &Path) -> Result<Configuration> {
    gitops_promotion_config::load_from_dir(start_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::process::Command;

    use gitops_promotion_config::CONFIG_FILE_NAME;
    use gitops_promotion_types::{CommitStatus, PullRequest};

    struct FakeProvider {
        prs: RefCell<BTreeMap<u64, PullRequest>>,
        statuses: RefCell<BTreeMap<String, bool>>,
        next_id: RefCell<u64>,
    }

    impl FakeProvider {
        fn new() -> Self {
            FakeProvider {
                prs: RefCell::new(BTreeMap::new()),
                statuses: RefCell::new(BTreeMap::new()),
                next_id: RefCell::new(1),
            }
        }

        fn set_status(&self, sha: &str, group: &str, env: &str, succeeded: bool) {
            self.statuses
                .borrow_mut()
                .insert(format!("{sha}:{group}:{env}"), succeeded);
        }

        fn merge(&self, id: u64, sha: &str) {
            if let Some(pr) = self.prs.borrow_mut().get_mut(&id) {
                if let Some(state) = pr.state.as_mut() {
                    state.sha = sha.to_string();
                    pr.description = state.encode().unwrap();
                }
            }
        }
    }

    impl GitProvider for FakeProvider {
        fn get_status(&self, sha: &str, group: &str, env: &str) -> Result<CommitStatus> {
            self.statuses
                .borrow()
                .get(&format!("{sha}:{group}:{env}"))
                .map(|succeeded| CommitStatus { succeeded: *succeeded })
                .ok_or_else(|| Error::NotFound("status not yet published".to_string()))
        }

        fn set_status(&self, sha: &str, group: &str, env: &str, succeeded: bool) -> Result<()> {
            self.set_status(sha, group, env, succeeded);
            Ok(())
        }

        fn create_or_update_pr(
            &self,
            branch: &str,
            _auto: bool,
            title: &str,
            description: &str,
        ) -> Result<u64> {
            let mut prs = self.prs.borrow_mut();
            if let Some((id, pr)) = prs.iter_mut().find(|(_, pr)| pr.title.ends_with(branch) || pr.description == description) {
                pr.description = description.to_string();
                return Ok(*id);
            }
            let mut next_id = self.next_id.borrow_mut();
            let id = *next_id;
            *next_id += 1;
            prs.insert(id, PullRequest::new(id, format!("{title} [{branch}]"), description.to_string()));
            Ok(id)
        }

        fn get_pr_with_branch(&self, source: &str, _target: &str) -> Result<PullRequest> {
            self.prs
                .borrow()
                .values()
                .find(|pr| pr.title.ends_with(&format!("[{source}]")))
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("no PR for branch {source}")))
        }

        fn get_pr_that_caused_commit(&self, sha: &str) -> Result<PullRequest> {
            self.prs
                .borrow()
                .values()
                .find(|pr| pr.state.as_ref().map(|s| s.sha.as_str()) == Some(sha))
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("no PR merged commit {sha}")))
        }

        fn merge_pr(&self, id: u64, sha: &str) -> Result<()> {
            self.merge(id, sha);
            Ok(())
        }
    }

    fn run_git(root: &Path, args: &[&str]) {
        let status = Command::new("git").current_dir(root).args(args).status().unwrap();
        assert!(status.success(), "git {args:?} failed");
    }

    fn init_repo_with_manifests() -> tempfile::TempDir {
        let td = tempfile::tempdir().unwrap();
        run_git(td.path(), &["init", "-q"]);
        run_git(td.path(), &["config", "user.email", "test@example.com"]);
        run_git(td.path(), &["config", "user.name", "Test"]);
        std::fs::create_dir_all(td.path().join("team1").join("dev")).unwrap();
        std::fs::write(
            td.path().join("team1").join("dev").join("deployment.yaml"),
            "image: app1:v0.0.1 # {\"$imagepolicy\": \"team1:app1\"}\n",
        )
        .unwrap();
        std::fs::write(
            td.path().join(CONFIG_FILE_NAME),
            "environments:\n  - name: dev\n    auto: true\n  - name: prod\n    auto: false\n",
        )
        .unwrap();
        run_git(td.path(), &["add", "."]);
        run_git(td.path(), &["commit", "-q", "-m", "initial"]);
        td
    }

    fn dispatcher(td: &Path, provider: FakeProvider) -> Dispatcher {
        let config = load_configuration(td).unwrap();
        let repo = Repository::open(td);
        Dispatcher::new(config, repo, Box::new(provider), CancelFlag::new())
    }

    /// Adds a bare `origin` remote pointed at `main`, so `default_branch`
    /// (which reads `origin/HEAD`) resolves the way it would against a
    /// real hosted repository. The returned `TempDir` must be kept alive
    /// for as long as the remote is in use.
    fn add_origin_remote(td: &Path) -> tempfile::TempDir {
        let bare = tempfile::tempdir().unwrap();
        run_git(bare.path(), &["init", "-q", "--bare", "-b", "main"]);
        run_git(td, &["remote", "add", "origin", bare.path().to_str().unwrap()]);
        run_git(td, &["push", "-q", "origin", "HEAD:main"]);
        run_git(td, &["fetch", "-q", "origin"]);
        run_git(td, &["remote", "set-head", "origin", "-a"]);
        bare
    }

    #[test]
    fn new_opens_a_promotion_pr_at_the_first_environment() {
        let td = init_repo_with_manifests();
        let _origin = add_origin_remote(td.path());
        let provider = FakeProvider::new();
        let dispatcher = dispatcher(td.path(), provider);

        let message = dispatcher.promote_new("team1", "app1", "v1.0.0").unwrap();
        assert!(message.starts_with("created branch promote/team1-app1"));

        let rewritten = std::fs::read_to_string(td.path().join("team1/dev/deployment.yaml")).unwrap();
        assert!(rewritten.contains("app1:v1.0.0"));
    }

    #[test]
    fn promote_skips_commits_not_produced_by_a_tracked_pr() {
        let td = init_repo_with_manifests();
        let provider = FakeProvider::new();
        let dispatcher = dispatcher(td.path(), provider);

        let message = dispatcher.promote().unwrap();
        assert_eq!(message, "skipping promotion as commit does not originate from PR");
    }

    #[test]
    fn status_on_a_manual_branch_is_skipped() {
        let td = init_repo_with_manifests();
        run_git(td.path(), &["checkout", "-b", "manual-work"]);
        let provider = FakeProvider::new();
        let dispatcher = dispatcher(td.path(), provider);

        let message = dispatcher.status().unwrap();
        assert_eq!(message, "Promotion was manual, skipping check");
    }

    #[test]
    fn status_reports_success_once_the_previous_environment_passes() {
        let td = init_repo_with_manifests();
        let _origin = add_origin_remote(td.path());

        let head = Command::new("git")
            .current_dir(td.path())
            .args(["rev-parse", "HEAD"])
            .output()
            .unwrap();
        let sha = String::from_utf8_lossy(&head.stdout).trim().to_string();

        let branch = "promote/team1-app1";
        run_git(td.path(), &["checkout", "-b", branch]);

        let provider = FakeProvider::new();
        provider.set_status(&sha, "team1", "dev", true);
        let state = PRState {
            group: "team1".to_string(),
            app: "app1".to_string(),
            tag: "v1.0.0".to_string(),
            env: "prod".to_string(),
            sha: sha.clone(),
            feature: None,
            pr_type: PRType::Promote,
        };
        provider.prs.borrow_mut().insert(
            1,
            PullRequest::new(1, format!("Promote app1 [{branch}]"), state.encode().unwrap()),
        );

        let dispatcher = dispatcher(td.path(), provider);
        let message = dispatcher.status().unwrap();
        assert_eq!(message, "status check has succeed for environment dev");
    }

    #[test]
    fn feature_new_forks_a_review_deployment() {
        let td = init_repo_with_manifests();
        let _origin = add_origin_remote(td.path());
        std::fs::write(
            td.path().join(CONFIG_FILE_NAME),
            "environments:\n  - name: dev\n    auto: true\n  - name: prod\n    auto: false\ngroups:\n  team1:\n    applications:\n      app1: {}\n",
        )
        .unwrap();
        std::fs::write(
            td.path().join("team1").join("dev").join("deployment.yaml"),
            "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: app1\n  labels: {}\nspec:\n  template:\n    spec:\n      containers:\n        - name: app1\n          image: app1:v0.0.1\n",
        )
        .unwrap();
        std::fs::write(
            td.path().join("team1").join("dev").join("kustomization.yaml"),
            "resources:\n  - deployment.yaml\n",
        )
        .unwrap();
        run_git(td.path(), &["add", "."]);
        run_git(td.path(), &["commit", "-q", "-m", "wire up feature config"]);

        let provider = FakeProvider::new();
        let dispatcher = dispatcher(td.path(), provider);

        let message = dispatcher
            .feature_new("team1", "app1", "v1.2.3", "My PR 9")
            .unwrap();
        assert!(message.starts_with("created branch feature/team1-app1-v1.2.3"));
        assert!(td.path().join("team1/dev/app1-my-pr-9").exists());
    }

    #[test]
    fn feature_delete_stale_reports_when_nothing_is_stale() {
        let td = init_repo_with_manifests();
        let provider = FakeProvider::new();
        let dispatcher = dispatcher(td.path(), provider);

        let message = dispatcher.feature_delete_stale(Duration::from_secs(3600)).unwrap();
        assert_eq!(message, "no stale feature deployments found");
    }

    fn commit_all_at(td: &Path, message: &str, unix_secs: i64) {
        let date = format!("{unix_secs} +0000");
        let status = Command::new("git")
            .current_dir(td)
            .env("GIT_AUTHOR_DATE", &date)
            .env("GIT_COMMITTER_DATE", &date)
            .args(["commit", "-q", "-m", message])
            .status()
            .unwrap();
        assert!(status.success());
    }

    #[test]
    fn feature_delete_stale_removes_directories_untouched_since_the_cutoff() {
        let td = init_repo_with_manifests();
        std::fs::write(
            td.path().join(CONFIG_FILE_NAME),
            "environments:\n  - name: dev\n    auto: true\n  - name: prod\n    auto: false\ngroups:\n  team1:\n    applications:\n      app1: {}\n",
        )
        .unwrap();
        std::fs::create_dir_all(td.path().join("team1/dev/app1-old")).unwrap();
        std::fs::write(
            td.path().join("team1/dev/app1-old/deployment.yaml"),
            "image: app1:v0.0.1\n",
        )
        .unwrap();
        run_git(td.path(), &["add", "."]);
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;
        commit_all_at(td.path(), "add old feature", now - 200_000);

        // A later commit that never touches the feature directory, so the
        // diff against it still shows the directory as untouched.
        std::fs::write(td.path().join("README.md"), "bump\n").unwrap();
        run_git(td.path(), &["add", "."]);
        commit_all_at(td.path(), "unrelated bump", now - 50_000);

        let _origin = add_origin_remote(td.path());
        let provider = FakeProvider::new();
        let dispatcher = dispatcher(td.path(), provider);

        let message = dispatcher
            .feature_delete_stale(Duration::from_secs(3600))
            .unwrap();
        assert!(message.contains("removing 1 stale feature deployment(s)"));
        assert!(!td.path().join("team1/dev/app1-old").exists());
    }
}
