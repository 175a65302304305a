//! The Azure-DevOps-style provider variant: a single REST client, native
//! PR auto-complete, and a dedicated merge-commit query endpoint.

use serde::{Deserialize, Serialize};

use gitops_promotion_retry::{CancelFlag, RetryError, RetryExecutor};
use gitops_promotion_types::{CommitStatus, Error, PullRequest, Result};

use crate::{parse_git_address, status_to_error, GitProvider, RetryableError};

const API_VERSION: &str = "7.1";
const STATUS_GENRE: &str = "fluxcd";

pub struct AzdoProvider {
    client: reqwest::blocking::Client,
    base_url: String,
    token: String,
    cancel: CancelFlag,
}

impl AzdoProvider {
    pub fn new(remote_url: &str, token: &str, cancel: CancelFlag) -> Result<Self> {
        let (host, id) = parse_git_address(remote_url)?;
        let (org, proj, repo) = split_azdo_id(&host, &id)?;

        let client = reqwest::blocking::Client::builder()
            .build()
            .map_err(|e| Error::Permanent(format!("could not build HTTP client: {e}")))?;

        Ok(AzdoProvider {
            client,
            base_url: format!(
                "https://dev.azure.com/{org}/{proj}/_apis/git/repositories/{repo}"
            ),
            token: token.to_string(),
            cancel,
        })
    }

    /// PAT auth: an empty username with the token as the password, per
    /// Azure DevOps' Basic-auth convention. The token is never logged —
    /// it only ever flows into this header.
    fn auth(&self, builder: reqwest::blocking::RequestBuilder) -> reqwest::blocking::RequestBuilder {
        builder.basic_auth("", Some(&self.token))
    }
}

/// `https://dev.azure.com/{org}/{proj}/_git/{repo}` has a 4-component id
/// (`org/proj/_git/repo`); `https://{org}.visualstudio.com/{proj}/_git/{repo}`
/// has a 3-component id with the org folded into the hostname instead.
fn split_azdo_id(host: &str, id: &str) -> Result<(String, String, String)> {
    let comp: Vec<&str> = id.split('/').collect();
    if host == "https://dev.azure.com" {
        if comp.len() != 4 {
            return Err(Error::InvalidConfig(format!("invalid repository id {id:?}")));
        }
        Ok((comp[0].to_string(), comp[1].to_string(), comp[3].to_string()))
    } else {
        if comp.len() != 3 {
            return Err(Error::InvalidConfig(format!("invalid repository id {id:?}")));
        }
        let org = host
            .trim_start_matches("https://")
            .split('.')
            .next()
            .ok_or_else(|| Error::InvalidConfig(format!("invalid host {host:?}")))?;
        Ok((org.to_string(), comp[0].to_string(), comp[2].to_string()))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct AzdoPr {
    #[serde(rename = "pullRequestId")]
    pull_request_id: u64,
    title: Option<String>,
    description: Option<String>,
    #[serde(rename = "createdBy")]
    created_by: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct AzdoPrList {
    value: Vec<AzdoPr>,
}

#[derive(Debug, Deserialize)]
struct AzdoStatus {
    state: String,
    context: AzdoStatusContext,
}

#[derive(Debug, Deserialize)]
struct AzdoStatusContext {
    name: String,
    genre: String,
}

#[derive(Debug, Deserialize)]
struct AzdoStatusList {
    value: Vec<AzdoStatus>,
}

impl GitProvider for AzdoProvider {
    fn get_status(&self, sha: &str, group: &str, env: &str) -> Result<CommitStatus> {
        let url = format!(
            "{}/commits/{sha}/statuses?api-version={API_VERSION}",
            self.base_url
        );
        let resp = self
            .auth(self.client.get(&url))
            .send()
            .map_err(|e| Error::Transient(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(status_to_error(resp.status(), "get_status"));
        }
        let statuses: AzdoStatusList = resp
            .json()
            .map_err(|e| Error::Permanent(format!("invalid status payload: {e}")))?;

        let name = format!("{group}-{env}");
        for s in statuses.value {
            let Some((_, suffix)) = s.context.name.split_once('/') else {
                return Err(Error::Permanent(format!(
                    "status name in wrong format: {:?}",
                    s.context.name
                )));
            };
            if s.context.genre == STATUS_GENRE && suffix == name {
                return Ok(CommitStatus {
                    succeeded: s.state == "succeeded",
                });
            }
        }
        Err(Error::NotFound(format!("no status found for sha {sha:?}")))
    }

    fn set_status(&self, sha: &str, group: &str, env: &str, succeeded: bool) -> Result<()> {
        let url = format!(
            "{}/commits/{sha}/statuses?api-version={API_VERSION}",
            self.base_url
        );
        let body = serde_json::json!({
            "state": if succeeded { "succeeded" } else { "failed" },
            "context": { "name": format!("kind/{group}-{env}"), "genre": STATUS_GENRE },
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
        let source_ref = format!("refs/heads/{branch}");
        let target_ref = "refs/heads/main".to_string();

        let list_url = format!(
            "{}/pullrequests?searchCriteria.sourceRefName={source_ref}&searchCriteria.targetRefName={target_ref}&api-version={API_VERSION}",
            self.base_url
        );
        let list_resp = self
            .auth(self.client.get(&list_url))
            .send()
            .map_err(|e| Error::Transient(e.to_string()))?;
        if !list_resp.status().is_success() {
            return Err(status_to_error(list_resp.status(), "list pull requests"));
        }
        let existing: AzdoPrList = list_resp
            .json()
            .map_err(|e| Error::Permanent(format!("invalid PR list payload: {e}")))?;

        if let Some(pr) = existing.value.into_iter().next() {
            let patch_url = format!("{}/pullrequests/{}?api-version={API_VERSION}", self.base_url, pr.pull_request_id);
            let mut body = serde_json::json!({ "title": title, "description": description });
            if auto {
                body["autoCompleteSetBy"] = pr.created_by.clone().unwrap_or(serde_json::Value::Null);
            }
            let resp = self
                .auth(self.client.patch(&patch_url))
                .json(&body)
                .send()
                .map_err(|e| Error::Transient(e.to_string()))?;
            if !resp.status().is_success() {
                return Err(status_to_error(resp.status(), "update pull request"));
            }
            return Ok(pr.pull_request_id);
        }

        let create_url = format!("{}/pullrequests?api-version={API_VERSION}", self.base_url);
        let body = serde_json::json!({
            "title": title,
            "description": description,
            "sourceRefName": source_ref,
            "targetRefName": target_ref,
            "completionOptions": { "deleteSourceBranch": true },
        });
        let resp = self
            .auth(self.client.post(&create_url))
            .json(&body)
            .send()
            .map_err(|e| Error::Transient(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(status_to_error(resp.status(), "create pull request"));
        }
        let created: AzdoPr = resp
            .json()
            .map_err(|e| Error::Permanent(format!("invalid PR payload: {e}")))?;

        if auto {
            let patch_url = format!(
                "{}/pullrequests/{}?api-version={API_VERSION}",
                self.base_url, created.pull_request_id
            );
            let body = serde_json::json!({ "autoCompleteSetBy": created.created_by });
            let resp = self
                .auth(self.client.patch(&patch_url))
                .json(&body)
                .send()
                .map_err(|e| Error::Transient(e.to_string()))?;
            if !resp.status().is_success() {
                return Err(status_to_error(resp.status(), "set auto-complete"));
            }
        }
        Ok(created.pull_request_id)
    }

    fn get_pr_with_branch(&self, source: &str, target: &str) -> Result<PullRequest> {
        let url = format!(
            "{}/pullrequests?searchCriteria.sourceRefName=refs/heads/{source}&searchCriteria.targetRefName=refs/heads/{target}&api-version={API_VERSION}",
            self.base_url
        );
        let resp = self
            .auth(self.client.get(&url))
            .send()
            .map_err(|e| Error::Transient(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(status_to_error(resp.status(), "get_pr_with_branch"));
        }
        let list: AzdoPrList = resp
            .json()
            .map_err(|e| Error::Permanent(format!("invalid PR list payload: {e}")))?;
        match list.value.len() {
            0 => Err(Error::NotFound(format!(
                "no PR found for branches {source:?}-{target:?}"
            ))),
            1 => {
                let pr = &list.value[0];
                Ok(PullRequest::new(
                    pr.pull_request_id,
                    pr.title.clone().unwrap_or_default(),
                    pr.description.clone().unwrap_or_default(),
                ))
            }
            n => Err(Error::Ambiguous(format!(
                "{n} pull requests match branches {source:?}-{target:?}"
            ))),
        }
    }

    fn get_pr_that_caused_commit(&self, sha: &str) -> Result<PullRequest> {
        let url = format!("{}/pullrequestquery?api-version={API_VERSION}", self.base_url);
        let body = serde_json::json!({
            "queries": [{ "items": [sha], "type": "lastMergeCommit" }]
        });
        let resp = self
            .auth(self.client.post(&url))
            .json(&body)
            .send()
            .map_err(|e| Error::Transient(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(status_to_error(resp.status(), "get_pr_that_caused_commit"));
        }
        let payload: serde_json::Value = resp
            .json()
            .map_err(|e| Error::Permanent(format!("invalid PR query payload: {e}")))?;
        let pr = payload
            .get("results")
            .and_then(|r| r.get(0))
            .and_then(|r| r.get(sha))
            .and_then(|matches| matches.get(0))
            .ok_or_else(|| Error::NotFound(format!("no PR found for commit {sha:?}")))?;
        let id = pr
            .get("pullRequestId")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| Error::Permanent("pull request query missing id".to_string()))?;
        let title = pr.get("title").and_then(|v| v.as_str()).unwrap_or_default();
        let description = pr
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        Ok(PullRequest::new(id, title, description))
    }

    fn merge_pr(&self, id: u64, sha: &str) -> Result<()> {
        let executor = RetryExecutor::default_bounded();
        let result = executor.run(&self.cancel, |attempt| self.try_complete(id, sha, attempt));
        match result {
            Ok(()) => Ok(()),
            Err(RetryError::ExhaustedAttempts(e)) | Err(RetryError::Permanent(e)) => Err(e.0),
            Err(RetryError::Cancelled) => Err(Error::Cancelled),
        }
    }
}

impl AzdoProvider {
    /// Completes the PR with `sha` as the last-merge-source commit. On a
    /// `405` the base branch may have advanced since the PR was opened;
    /// refresh the source branch first, then retry the completion —
    /// matching the documented merge-retry contract (§4.6, at most 5
    /// attempts total, driven by the shared retry executor).
    fn try_complete(&self, id: u64, sha: &str, attempt: u32) -> std::result::Result<(), RetryableError> {
        let url = format!("{}/pullrequests/{id}?api-version={API_VERSION}", self.base_url);
        let body = serde_json::json!({
            "status": "completed",
            "lastMergeSourceCommit": { "commitId": sha },
        });
        let resp = self
            .auth(self.client.patch(&url))
            .json(&body)
            .send()
            .map_err(|e| RetryableError(Error::Transient(e.to_string())))?;

        if resp.status().is_success() {
            return Ok(());
        }
        if resp.status().as_u16() == 405 && attempt < 5 {
            let update_url = format!(
                "{}/pullrequests/{id}/refs?api-version={API_VERSION}",
                self.base_url
            );
            let _ = self.auth(self.client.post(&update_url)).send();
            return Err(RetryableError(Error::Transient(format!(
                "merge not yet permitted (405) on attempt {attempt}"
            ))));
        }
        Err(RetryableError(status_to_error(resp.status(), "merge_pr")))
    }
}
