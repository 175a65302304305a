//! Unifies two hosted-git REST APIs behind one [`GitProvider`] contract.
//!
//! Two variants ship: [`azdo::AzdoProvider`] for an Azure-DevOps-style
//! platform with native auto-complete and a merge-commit query endpoint,
//! and [`github::GithubProvider`] for a GitHub-style platform that has
//! neither and instead relies on list+filter plus a bounded retry for
//! eventual consistency.

use gitops_promotion_retry::{CancelFlag, Classify};
use gitops_promotion_types::{CommitStatus, Error, PullRequest, Result};

pub mod azdo;
pub mod github;

/// Which hosted-git platform to talk to. Selected by the `--provider`
/// CLI flag; parsing an unknown value is rejected by `clap` before this
/// type is ever constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Azdo,
    Github,
}

impl std::str::FromStr for ProviderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "azdo" => Ok(ProviderKind::Azdo),
            "github" => Ok(ProviderKind::Github),
            other => Err(Error::InvalidConfig(format!(
                "unknown provider type: {other}"
            ))),
        }
    }
}

/// The operations the dispatcher consumes from a hosted-git platform.
/// Every suspension point here is a blocking HTTPS call — see the
/// concurrency notes in the top-level design doc for why blocking
/// `reqwest` was kept over async.
pub trait GitProvider {
    fn get_status(&self, sha: &str, group: &str, env: &str) -> Result<CommitStatus>;
    fn set_status(&self, sha: &str, group: &str, env: &str, succeeded: bool) -> Result<()>;
    fn create_or_update_pr(
        &self,
        branch: &str,
        auto: bool,
        title: &str,
        description: &str,
    ) -> Result<u64>;
    fn get_pr_with_branch(&self, source: &str, target: &str) -> Result<PullRequest>;
    fn get_pr_that_caused_commit(&self, sha: &str) -> Result<PullRequest>;
    fn merge_pr(&self, id: u64, sha: &str) -> Result<()>;
}

/// Constructs the provider variant named by `kind`, validating the
/// remote URL and (for hosted-B) the token eagerly so construction fails
/// fast rather than deep inside the first verb-specific call.
pub fn new_provider(
    kind: ProviderKind,
    remote_url: &str,
    token: &str,
    cancel: CancelFlag,
) -> Result<Box<dyn GitProvider>> {
    match kind {
        ProviderKind::Azdo => Ok(Box::new(azdo::AzdoProvider::new(remote_url, token, cancel)?)),
        ProviderKind::Github => Ok(Box::new(github::GithubProvider::new(remote_url, token, cancel)?)),
    }
}

/// Splits a git remote address into `(host, id)`, tolerating an
/// `ssh://` scheme, an embedded `user@` userinfo component, and a
/// trailing `.git` suffix. `host` is everything up to and including the
/// authority; `id` is the remaining path with leading/trailing slashes
/// stripped.
///
/// Examples:
/// - `https://dev.azure.com/org/proj/_git/repo` → `("https://dev.azure.com", "org/proj/_git/repo")`
/// - `https://user@dev.azure.com/org/proj/_git/repo` → same
/// - `ssh://dev.azure.com/org/proj/_git/repo` → same, scheme normalized to `https`
/// - `https://github.com/owner/repo.git` → `("https://github.com", "owner/repo")`
pub fn parse_git_address(remote_url: &str) -> Result<(String, String)> {
    let without_scheme = remote_url
        .strip_prefix("https://")
        .or_else(|| remote_url.strip_prefix("http://"))
        .or_else(|| remote_url.strip_prefix("ssh://"))
        .ok_or_else(|| Error::InvalidConfig(format!("unsupported remote URL scheme: {remote_url}")))?;

    let without_scheme = without_scheme.trim_end_matches(".git");
    let (authority_and_path, _) = (without_scheme, ());
    let (authority, path) = authority_and_path
        .split_once('/')
        .ok_or_else(|| Error::InvalidConfig(format!("remote URL has no path: {remote_url}")))?;

    let authority = authority.rsplit_once('@').map_or(authority, |(_, host)| host);
    let path = path.trim_matches('/');
    if path.is_empty() {
        return Err(Error::InvalidConfig(format!(
            "remote URL path is empty: {remote_url}"
        )));
    }

    Ok((format!("https://{authority}"), path.to_string()))
}

/// Classification shim letting provider error variants drive the shared
/// retry executor without the retry crate depending on the domain error
/// type.
pub struct RetryableError(pub Error);

impl Classify for RetryableError {
    fn is_retryable(&self) -> bool {
        matches!(self.0, Error::Transient(_))
    }
}

/// Maps an HTTP status code to the crate-wide error taxonomy, shared by
/// both provider variants.
pub(crate) fn status_to_error(status: reqwest::StatusCode, context: &str) -> Error {
    match status {
        s if s.as_u16() == 401 || s.as_u16() == 403 => {
            Error::Unauthorized(format!("{context}: {status}"))
        }
        s if s.as_u16() == 404 => Error::NotFound(format!("{context}: {status}")),
        s if s.as_u16() == 409 => Error::Transient(format!("{context}: conflict ({status})")),
        s if s.is_server_error() || s.as_u16() == 429 => {
            Error::Transient(format!("{context}: {status}"))
        }
        s => Error::Permanent(format!("{context}: unexpected status {s}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_azdo_dev_azure_com_address() {
        let (host, id) = parse_git_address("https://dev.azure.com/org/proj/_git/repo").unwrap();
        assert_eq!(host, "https://dev.azure.com");
        assert_eq!(id, "org/proj/_git/repo");
    }

    #[test]
    fn parses_address_with_userinfo() {
        let (host, id) =
            parse_git_address("https://user@dev.azure.com/org/proj/_git/repo").unwrap();
        assert_eq!(host, "https://dev.azure.com");
        assert_eq!(id, "org/proj/_git/repo");
    }

    #[test]
    fn parses_ssh_scheme() {
        let (host, id) = parse_git_address("ssh://dev.azure.com/org/proj/_git/repo").unwrap();
        assert_eq!(host, "https://dev.azure.com");
        assert_eq!(id, "org/proj/_git/repo");
    }

    #[test]
    fn strips_trailing_dot_git() {
        let (host, id) = parse_git_address("https://github.com/owner/repo.git").unwrap();
        assert_eq!(host, "https://github.com");
        assert_eq!(id, "owner/repo");
    }

    #[test]
    fn provider_kind_rejects_unknown_value() {
        assert!("totally-unknown".parse::<ProviderKind>().is_err());
        assert_eq!("azdo".parse::<ProviderKind>().unwrap(), ProviderKind::Azdo);
        assert_eq!(
            "github".parse::<ProviderKind>().unwrap(),
            ProviderKind::Github
        );
    }

    #[test]
    fn status_to_error_maps_well_known_codes() {
        assert!(matches!(
            status_to_error(reqwest::StatusCode::NOT_FOUND, "x"),
            Error::NotFound(_)
        ));
        assert!(matches!(
            status_to_error(reqwest::StatusCode::UNAUTHORIZED, "x"),
            Error::Unauthorized(_)
        ));
        assert!(matches!(
            status_to_error(reqwest::StatusCode::FORBIDDEN, "x"),
            Error::Unauthorized(_)
        ));
        assert!(matches!(
            status_to_error(reqwest::StatusCode::TOO_MANY_REQUESTS, "x"),
            Error::Transient(_)
        ));
        assert!(matches!(
            status_to_error(reqwest::StatusCode::INTERNAL_SERVER_ERROR, "x"),
            Error::Transient(_)
        ));
        assert!(matches!(
            status_to_error(reqwest::StatusCode::CONFLICT, "x"),
            Error::Transient(_)
        ));
        assert!(matches!(
            status_to_error(reqwest::StatusCode::IM_A_TEAPOT, "x"),
            Error::Permanent(_)
        ));
    }
}
