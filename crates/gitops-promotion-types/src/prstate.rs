use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Discriminates a promotion pull request from a feature-review pull
/// request. Absent in older descriptions, in which case it means
/// `Promote` — see [`PRState::decode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PRType {
    Promote,
    Feature,
}

impl Default for PRType {
    fn default() -> Self {
        PRType::Promote
    }
}

/// The promotion record embedded in a pull request's description. Field
/// order matches the declaration order below, which `serde_json`
/// preserves on serialization — this is what keeps [`PRState::encode`]
/// byte-stable across runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PRState {
    pub group: String,
    pub app: String,
    pub tag: String,
    pub env: String,
    pub sha: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature: Option<String>,
    #[serde(default, rename = "type")]
    pub pr_type: PRType,
}

const METADATA_PREFIX: &str = "<!-- metadata = ";
const METADATA_SUFFIX: &str = " -->";

impl PRState {
    /// Renders the exact pull-request description this crate writes:
    /// the metadata comment followed by three human-readable body lines.
    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_string(self)?;
        Ok(format!(
            "{METADATA_PREFIX}{json}{METADATA_SUFFIX}\n\tENV: {}\n\tAPP: {}\n\tTAG: {}",
            self.env, self.app, self.tag
        ))
    }

    /// Parses a pull-request description. Returns `Ok(None)` when the
    /// description carries no metadata comment (the PR was not produced
    /// by this tool) and `Err` only when a comment is present but its
    /// JSON payload is malformed.
    pub fn decode(description: &str) -> Result<Option<PRState>> {
        let Some((before_suffix, _)) = description.split_once(METADATA_SUFFIX) else {
            return Ok(None);
        };
        let Some(json) = before_suffix.strip_prefix(METADATA_PREFIX) else {
            return Ok(None);
        };
        let state: PRState = serde_json::from_str(json)?;
        Ok(Some(state))
    }

    /// The branch this state should live on. `include_env` is driven by
    /// the configured `pr_flow`: `per-env` namespaces the branch by
    /// environment so each environment keeps its own branch.
    pub fn branch_name(&self, include_env: bool) -> String {
        let kind = self.type_component();
        let tail = match self.pr_type {
            PRType::Promote => format!("{}-{}", self.group, self.app),
            PRType::Feature => format!("{}-{}-{}", self.group, self.app, self.tag),
        };
        if include_env {
            format!("{kind}/{}/{tail}", self.env)
        } else {
            format!("{kind}/{tail}")
        }
    }

    pub fn title(&self) -> String {
        match self.pr_type {
            PRType::Promote => format!(
                "Promote {}/{} version {} to environment {}",
                self.group, self.app, self.tag, self.env
            ),
            PRType::Feature => format!(
                "Review {}/{} feature {} in environment {}",
                self.group, self.app, self.tag, self.env
            ),
        }
    }

    fn type_component(&self) -> &'static str {
        match self.pr_type {
            PRType::Promote => "promote",
            PRType::Feature => "feature",
        }
    }
}

/// Sanitizes a user-supplied feature name to `[a-z0-9-]+`: lowercase,
/// collapse every run of other characters to a single `-`, and trim
/// leading/trailing `-`.
pub fn sanitize_feature_name(raw: &str) -> Result<String> {
    let lowered = raw.to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    let mut last_was_dash = false;
    for c in lowered.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_was_dash = false;
        } else if !last_was_dash {
            out.push('-');
            last_was_dash = true;
        }
    }
    let trimmed = out.trim_matches('-').to_string();
    if trimmed.is_empty() {
        return Err(Error::InvalidConfig(format!(
            "feature name {raw:?} sanitizes to an empty string"
        )));
    }
    Ok(trimmed)
}
