//! The GitHub-style provider variant: a flat, genre-less commit-status
//! model and no native merge-commit query, so the dispatcher's
//! cause-of-commit lookup is emulated with a list-and-filter pass over
//! recently closed pull requests.

use serde::{Deserialize, Serialize};

use gitops_promotion_retry::{CancelFlag, RetryError, RetryExecutor};
use gitops_promotion_types::{CommitStatus, Error, PullRequest, Result};

use crate::{parse_git_address, status_to_error, GitProvider, RetryableError};

#[derive(Debug)]
pub struct GithubProvider {
    client: reqwest::blocking::Client,
    base_url: String,
    graphql_url: String,
    token: String,
    cancel: CancelFlag,
}

impl GithubProvider {
    /// Parses `owner/repo` out of the remote URL, then probes the token
    /// with a cheap authenticated GET so a bad credential fails at
    /// construction time rather than inside the first promotion verb.
    pub fn new(remote_url: &str, token: &str, cancel: CancelFlag) -> Result<Self> {
        let (host, id) = parse_git_address(remote_url)?;
        let comp: Vec<&str> = id.split('/').collect();
        if comp.len() != 2 {
            return Err(Error::InvalidConfig(format!(
                "invalid repository id {id:?}, expected owner/repo"
            )));
        }

        let client = reqwest::blocking::Client::builder()
            .user_agent("gitops-promotion")
            .build()
            .map_err(|e| Error::Permanent(format!("could not build HTTP client: {e}")))?;

        let (api_host, graphql_url) = if host == "https://github.com" {
            ("https://api.github.com".to_string(), "https://api.github.com/graphql".to_string())
        } else {
            // GitHub Enterprise Server exposes REST under /api/v3 and
            // GraphQL under /api/graphql.
            (format!("{host}/api/v3"), format!("{host}/api/graphql"))
        };

        let provider = GithubProvider {
            client,
            base_url: format!("{api_host}/repos/{}/{}", comp[0], comp[1]),
            graphql_url,
            token: token.to_string(),
            cancel,
        };
        provider.check_token()?;
        Ok(provider)
    }

    fn auth(&self, builder: reqwest::blocking::RequestBuilder) -> reqwest::blocking::RequestBuilder {
        builder.bearer_auth(&self.token)
    }

    fn check_token(&self) -> Result<()> {
        let resp = self
            .auth(self.client.get(&self.base_url))
            .send()
            .map_err(|e| Error::Transient(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(status_to_error(resp.status(), "authenticate"));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct GithubPr {
    number: u64,
    #[serde(rename = "node_id")]
    node_id: String,
    title: Option<String>,
    body: Option<String>,
    #[serde(default)]
    merged: bool,
    #[serde(rename = "merge_commit_sha")]
    merge_commit_sha: Option<String>,
    head: GithubRef,
}

#[derive(Debug, Deserialize)]
struct GraphqlResponse {
    #[serde(default)]
    errors: Option<Vec<GraphqlError>>,
}

#[derive(Debug, Deserialize)]
struct GraphqlError {
    message: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct GithubRef {
    #[serde(rename = "ref")]
    branch: String,
}

#[derive(Debug, Deserialize)]
struct GithubStatusList {
    statuses: Vec<GithubStatus>,
}

#[derive(Debug, Deserialize)]
struct GithubStatus {
    state: String,
    context: String,
}

impl GitProvider for GithubProvider {
    fn get_status(&self, sha: &str, group: &str, env: &str) -> Result<CommitStatus> {
        let url = format!("{}/commits/{sha}/status", self.base_url);
        let resp = self
            .auth(self.client.get(&url))
            .send()
            .map_err(|e| Error::Transient(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(status_to_error(resp.status(), "get_status"));
        }
        let body: GithubStatusList = resp
            .json()
            .map_err(|e| Error::Permanent(format!("invalid status payload: {e}")))?;

        let context = format!("kind/{group}-{env}");
        for s in body.statuses {
            if s.context == context {
                return Ok(CommitStatus {
                    succeeded: s.state == "success",
                });
            }
        }
        Err(Error::NotFound(format!("no status found for sha {sha:?}")))
    }

    fn set_status(&self, sha: &str, group: &str, env: &str, succeeded: bool) -> Result<()> {
        let url = format!("{}/statuses/{sha}", self.base_url);
        let body = serde_json::json!({
            "state": if succeeded { "success" } else { "failure" },
            "context": format!("kind/{group}-{env}"),
            "description": format!("{group}-{env}-{sha}"),
        });
        let resp = self
            .auth(self.client.post(&url))
            .timeout(std::time::Duration::from_secs(5))
            .json(&body)
            .send()
            .map_err(|e| Error::Transient(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(status_to_error(resp.status(), "set_status"));
        }
        Ok(())
    }

    fn create_or_update_pr(
        &self,
        branch: &str,
        auto: bool,
        title: &str,
        description: &str,
    ) -> Result<u64> {
        let list_url = format!(
            "{}/pulls?state=open&head={}:{branch}&base=main",
            self.base_url,
            self.owner()
        );
        let list_resp = self
            .auth(self.client.get(&list_url))
            .send()
            .map_err(|e| Error::Transient(e.to_string()))?;
        if !list_resp.status().is_success() {
            return Err(status_to_error(list_resp.status(), "list pull requests"));
        }
        let existing: Vec<GithubPr> = list_resp
            .json()
            .map_err(|e| Error::Permanent(format!("invalid PR list payload: {e}")))?;

        let (number, node_id) = match existing.len() {
            0 => {
                let create_url = format!("{}/pulls", self.base_url);
                let body = serde_json::json!({
                    "title": title,
                    "body": description,
                    "head": branch,
                    "base": "main",
                });
                let resp = self
                    .auth(self.client.post(&create_url))
                    .json(&body)
                    .send()
                    .map_err(|e| Error::Transient(e.to_string()))?;
                if !resp.status().is_success() {
                    return Err(status_to_error(resp.status(), "create pull request"));
                }
                let created: GithubPr = resp
                    .json()
                    .map_err(|e| Error::Permanent(format!("invalid PR payload: {e}")))?;
                (created.number, created.node_id)
            }
            1 => {
                let pr = &existing[0];
                let patch_url = format!("{}/pulls/{}", self.base_url, pr.number);
                let body = serde_json::json!({ "title": title, "body": description });
                let resp = self
                    .auth(self.client.patch(&patch_url))
                    .json(&body)
                    .send()
                    .map_err(|e| Error::Transient(e.to_string()))?;
                if !resp.status().is_success() {
                    return Err(status_to_error(resp.status(), "update pull request"));
                }
                (pr.number, pr.node_id.clone())
            }
            n => {
                return Err(Error::Ambiguous(format!(
                    "{n} open pull requests already exist for branch {branch:?}"
                )))
            }
        };

        if auto {
            self.enable_auto_merge(&node_id, number)?;
        }

        Ok(number)
    }

    fn get_pr_with_branch(&self, source: &str, target: &str) -> Result<PullRequest> {
        let url = format!(
            "{}/pulls?state=all&head={}:{source}&base={target}",
            self.base_url,
            self.owner()
        );
        let resp = self
            .auth(self.client.get(&url))
            .send()
            .map_err(|e| Error::Transient(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(status_to_error(resp.status(), "get_pr_with_branch"));
        }
        let list: Vec<GithubPr> = resp
            .json()
            .map_err(|e| Error::Permanent(format!("invalid PR list payload: {e}")))?;
        match list.len() {
            0 => Err(Error::NotFound(format!(
                "no PR found for branches {source:?}-{target:?}"
            ))),
            1 => {
                let pr = &list[0];
                Ok(PullRequest::new(
                    pr.number,
                    pr.title.clone().unwrap_or_default(),
                    pr.body.clone().unwrap_or_default(),
                ))
            }
            n => Err(Error::Ambiguous(format!(
                "{n} pull requests match branches {source:?}-{target:?}"
            ))),
        }
    }

    /// No native merge-commit query exists, so this lists recently closed
    /// pull requests and filters by `merge_commit_sha` instead, wrapped in
    /// a bounded retry since the merge and the commit-status write that
    /// follows it are not transactional on this platform.
    fn get_pr_that_caused_commit(&self, sha: &str) -> Result<PullRequest> {
        let executor = RetryExecutor::default_bounded();
        let result = executor.run(&self.cancel, |_attempt| self.find_merged_pr(sha));
        match result {
            Ok(pr) => Ok(pr),
            Err(RetryError::ExhaustedAttempts(e)) | Err(RetryError::Permanent(e)) => Err(e.0),
            Err(RetryError::Cancelled) => Err(Error::Cancelled),
        }
    }

    /// Direct merge; unlike the Azure-DevOps-style variant there is no
    /// update-branch-then-retry dance, since GitHub returns a plain `405`
    /// only when the PR is already closed and a `409` (surfaced here as
    /// `Transient`, not retried) when the head branch has moved.
    fn merge_pr(&self, id: u64, _sha: &str) -> Result<()> {
        let url = format!("{}/pulls/{id}/merge", self.base_url);
        let body = serde_json::json!({ "merge_method": "squash" });
        let resp = self
            .auth(self.client.put(&url))
            .json(&body)
            .send()
            .map_err(|e| Error::Transient(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(status_to_error(resp.status(), "merge_pr"));
        }
        Ok(())
    }
}

impl GithubProvider {
    /// Enables auto-merge via the `enablePullRequestAutoMerge` mutation,
    /// the only way to defer a merge until required checks pass on this
    /// platform. When the PR is already mergeable (e.g. no checks are
    /// configured on the target branch) GitHub rejects the mutation with
    /// "Pull request ... is in clean status" / "not in the correct
    /// state"; that rejection falls back to a direct merge instead of
    /// being treated as a failure.
    fn enable_auto_merge(&self, node_id: &str, number: u64) -> Result<()> {
        let query = "mutation($id: ID!, $method: PullRequestMergeMethod!) { \
            enablePullRequestAutoMerge(input: { pullRequestId: $id, mergeMethod: $method }) { \
            pullRequest { id } } }";
        let body = serde_json::json!({
            "query": query,
            "variables": { "id": node_id, "method": "SQUASH" },
        });
        let resp = self
            .auth(self.client.post(&self.graphql_url))
            .json(&body)
            .send()
            .map_err(|e| Error::Transient(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(status_to_error(resp.status(), "enable auto-merge"));
        }
        let payload: GraphqlResponse = resp
            .json()
            .map_err(|e| Error::Permanent(format!("invalid auto-merge payload: {e}")))?;

        let Some(errors) = payload.errors else {
            return Ok(());
        };
        let not_in_correct_state = errors
            .iter()
            .any(|e| e.message.to_lowercase().contains("not in the correct state")
                || e.message.to_lowercase().contains("clean status"));
        if !not_in_correct_state {
            return Err(Error::Permanent(format!(
                "auto-merge mutation failed: {}",
                errors.into_iter().map(|e| e.message).collect::<Vec<_>>().join("; ")
            )));
        }

        let merge_url = format!("{}/pulls/{number}/merge", self.base_url);
        let body = serde_json::json!({ "merge_method": "squash" });
        let resp = self
            .auth(self.client.put(&merge_url))
            .json(&body)
            .send()
            .map_err(|e| Error::Transient(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(status_to_error(resp.status(), "merge_pr"));
        }
        Ok(())
    }

    fn owner(&self) -> &str {
        // base_url is ".../repos/{owner}/{repo}"; owner is the second-to-last segment.
        self.base_url
            .rsplit('/')
            .nth(1)
            .unwrap_or_default()
    }

    fn find_merged_pr(&self, sha: &str) -> std::result::Result<PullRequest, RetryableError> {
        let url = format!("{}/pulls?state=closed&sort=updated&direction=desc", self.base_url);
        let resp = self
            .auth(self.client.get(&url))
            .send()
            .map_err(|e| RetryableError(Error::Transient(e.to_string())))?;
        if !resp.status().is_success() {
            return Err(RetryableError(status_to_error(
                resp.status(),
                "get_pr_that_caused_commit",
            )));
        }
        let list: Vec<GithubPr> = resp.json().map_err(|e| {
            RetryableError(Error::Permanent(format!("invalid PR list payload: {e}")))
        })?;

        match list
            .into_iter()
            .find(|pr| pr.merged && pr.merge_commit_sha.as_deref() == Some(sha))
        {
            Some(pr) => Ok(PullRequest::new(
                pr.number,
                pr.title.unwrap_or_default(),
                pr.body.unwrap_or_default(),
            )),
            None => Err(RetryableError(Error::NotFound(format!(
                "no merged PR found for commit {sha:?}"
            )))),
        }
    }
}
