//! Domain types shared by every `gitops-promotion` crate: the promotion
//! policy (`Configuration`), the per-promotion record embedded in pull
//! request descriptions (`PRState`), and the crate-wide error taxonomy.
//!
//! Kept dependency-free of HTTP/YAML/git concerns so every other crate in
//! the workspace can depend on it without pulling in a provider client or
//! a config-file parser.

use std::time::Duration;

use serde::{Deserialize, Serialize};

mod error;
mod prstate;

pub use error::Error;
pub use prstate::{sanitize_feature_name, PRState, PRType};

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;

/// A single slot in the ordered deployment sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub name: String,
    #[serde(rename = "auto", default)]
    pub automated: bool,
}

/// The branch-naming convention used when materializing a promotion PR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PrFlow {
    /// One branch per (group, app); the newest promotion PR for an app
    /// always supersedes the previous one.
    PerApp,
    /// One branch per (group, app, environment), so every environment's
    /// promotion PR lives on its own branch.
    PerEnv,
}

impl Default for PrFlow {
    fn default() -> Self {
        PrFlow::PerApp
    }
}

/// Per-application feature-deployment settings: the label selector used to
/// find the manifests a feature branch should fork.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(rename = "featureLabelSelector", default)]
    pub feature_label_selector: std::collections::BTreeMap<String, String>,
}

/// A named collection of applications sharing manifest layout conventions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupConfig {
    #[serde(default)]
    pub applications: std::collections::BTreeMap<String, AppConfig>,
}

fn default_status_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

/// (De)serializes `status_timeout_minutes` as a plain integer count of
/// minutes, per the configuration file format documented in the crate's
/// external-interface notes — not a humantime string.
mod minutes_as_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs() / 60)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let minutes = u64::deserialize(d)?;
        Ok(Duration::from_secs(minutes * 60))
    }
}

/// The parsed and validated `gitops-promotion.yaml` policy.
///
/// Fields are private: callers observe the policy only through the derived
/// query methods below, which is what lets [`load`](fn@crate::Error) keep
/// ownership of every invariant (non-empty environments, valid `pr_flow`,
/// defaulted timeout) in one place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Configuration {
    #[serde(rename = "prflow", default)]
    pr_flow: PrFlow,
    #[serde(
        rename = "status_timeout_minutes",
        default = "default_status_timeout",
        with = "minutes_as_duration"
    )]
    status_timeout: Duration,
    environments: Vec<Environment>,
    #[serde(default)]
    groups: std::collections::BTreeMap<String, GroupConfig>,
}

impl Configuration {
    /// Builds a configuration directly, applying the same defaulting and
    /// validation `load` applies to parsed YAML. Primarily useful for
    /// tests and for embedders that build a policy programmatically.
    pub fn new(
        pr_flow: Option<PrFlow>,
        status_timeout: Option<Duration>,
        environments: Vec<Environment>,
        groups: std::collections::BTreeMap<String, GroupConfig>,
    ) -> Result<Self> {
        if environments.is_empty() {
            return Err(Error::InvalidConfig(
                "environments list cannot be empty".to_string(),
            ));
        }
        let status_timeout = match status_timeout {
            Some(d) if d.is_zero() => default_status_timeout(),
            Some(d) => d,
            None => default_status_timeout(),
        };
        Ok(Configuration {
            pr_flow: pr_flow.unwrap_or_default(),
            status_timeout,
            environments,
            groups,
        })
    }

    /// Validates invariants that cannot be expressed through `serde`
    /// defaults alone, and normalizes a zero-valued timeout. Called by the
    /// `gitops-promotion-config` loader right after deserialization.
    pub fn validate_and_normalize(mut self) -> Result<Self> {
        if self.environments.is_empty() {
            return Err(Error::InvalidConfig(
                "environments list cannot be empty".to_string(),
            ));
        }
        if self.status_timeout.is_zero() {
            self.status_timeout = default_status_timeout();
        }
        Ok(self)
    }

    pub fn pr_flow(&self) -> PrFlow {
        self.pr_flow
    }

    pub fn status_timeout(&self) -> Duration {
        self.status_timeout
    }

    pub fn environments(&self) -> &[Environment] {
        &self.environments
    }

    pub fn first_environment(&self) -> &Environment {
        // Invariant established at construction: environments is non-empty.
        &self.environments[0]
    }

    fn position_of(&self, name: &str) -> Result<usize> {
        self.environments
            .iter()
            .position(|e| e.name == name)
            .ok_or_else(|| Error::NotFound(format!("environment named {name} does not exist")))
    }

    pub fn has_next(&self, name: &str) -> Result<bool> {
        let i = self.position_of(name)?;
        Ok(i != self.environments.len() - 1)
    }

    pub fn next(&self, name: &str) -> Result<&Environment> {
        let i = self.position_of(name)?;
        if i == self.environments.len() - 1 {
            return Err(Error::OutOfRange(
                "last environment cannot have a next environment".to_string(),
            ));
        }
        Ok(&self.environments[i + 1])
    }

    pub fn prev(&self, name: &str) -> Result<&Environment> {
        let i = self.position_of(name)?;
        if i == 0 {
            return Err(Error::OutOfRange(
                "first environment cannot have a previous environment".to_string(),
            ));
        }
        Ok(&self.environments[i - 1])
    }

    pub fn is_automated(&self, name: &str) -> Result<bool> {
        let i = self.position_of(name)?;
        Ok(self.environments[i].automated)
    }

    pub fn any_manual(&self) -> bool {
        self.environments.iter().any(|e| !e.automated)
    }

    pub fn feature_label_selector(
        &self,
        group: &str,
        app: &str,
    ) -> Result<&std::collections::BTreeMap<String, String>> {
        let g = self
            .groups
            .get(group)
            .ok_or_else(|| Error::NotFound(format!("configuration does not contain group {group}")))?;
        let a = g.applications.get(app).ok_or_else(|| {
            Error::NotFound(format!(
                "configuration group {group} does not contain app {app}"
            ))
        })?;
        Ok(&a.feature_label_selector)
    }

    /// All declared (group, app) pairs, used by `feature-delete-stale` to
    /// enumerate candidate feature directories.
    pub fn all_apps(&self) -> impl Iterator<Item = (&str, &str)> {
        self.groups.iter().flat_map(|(group, g)| {
            g.applications
                .keys()
                .map(move |app| (group.as_str(), app.as_str()))
        })
    }
}

/// The outcome of a commit-status lookup — the smallest surface the
/// dispatcher needs to decide whether a previous environment reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitStatus {
    pub succeeded: bool,
}

/// A pull request as observed through a provider, with its embedded
/// promotion record parsed out of the description (if any).
#[derive(Debug, Clone)]
pub struct PullRequest {
    pub id: u64,
    pub title: String,
    pub description: String,
    pub state: Option<PRState>,
}

impl PullRequest {
    pub fn new(id: u64, title: impl Into<String>, description: impl Into<String>) -> Self {
        let description = description.into();
        let state = PRState::decode(&description).ok().flatten();
        PullRequest {
            id,
            title: title.into(),
            description,
            state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(name: &str, automated: bool) -> Environment {
        Environment {
            name: name.to_string(),
            automated,
        }
    }

    fn sample_config() -> Configuration {
        Configuration::new(
            None,
            None,
            vec![env("dev", true), env("qa", true), env("prod", false)],
            Default::default(),
        )
        .unwrap()
    }

    #[test]
    fn rejects_empty_environment_list() {
        let err = Configuration::new(None, None, vec![], Default::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn has_next_is_false_only_for_last_environment() {
        let cfg = sample_config();
        assert!(cfg.has_next("dev").unwrap());
        assert!(cfg.has_next("qa").unwrap());
        assert!(!cfg.has_next("prod").unwrap());
    }

    #[test]
    fn next_and_prev_fail_at_the_ends() {
        let cfg = sample_config();
        assert!(matches!(cfg.prev("dev"), Err(Error::OutOfRange(_))));
        assert!(matches!(cfg.next("prod"), Err(Error::OutOfRange(_))));
        assert_eq!(cfg.next("dev").unwrap().name, "qa");
        assert_eq!(cfg.prev("prod").unwrap().name, "qa");
    }

    #[test]
    fn is_automated_fails_not_found_for_unknown_environment() {
        let cfg = sample_config();
        assert!(matches!(
            cfg.is_automated("staging"),
            Err(Error::NotFound(_))
        ));
        assert!(cfg.is_automated("dev").unwrap());
        assert!(!cfg.is_automated("prod").unwrap());
    }

    #[test]
    fn any_manual_detects_non_automated_environment() {
        assert!(sample_config().any_manual());
        let all_auto = Configuration::new(
            None,
            None,
            vec![env("dev", true), env("qa", true)],
            Default::default(),
        )
        .unwrap();
        assert!(!all_auto.any_manual());
    }

    #[test]
    fn zero_status_timeout_defaults_to_five_minutes() {
        let cfg = Configuration::new(
            None,
            Some(Duration::ZERO),
            vec![env("dev", true)],
            Default::default(),
        )
        .unwrap();
        assert_eq!(cfg.status_timeout(), Duration::from_secs(300));
    }
}
