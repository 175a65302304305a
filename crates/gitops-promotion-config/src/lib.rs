//! Loads `gitops-promotion.yaml`, the repository's promotion policy.
//!
//! Mirrors the directory-walk-up discovery pattern used for `.toml`
//! config files elsewhere in this workspace's ecosystem, adapted to YAML
//! since the policy file's shape (nested environment/group/app maps) is
//! a more natural fit for YAML than for TOML.

use std::path::{Path, PathBuf};

use gitops_promotion_types::{Configuration, Error, Result};

/// The well-known file name this tool looks for at the repository root.
pub const CONFIG_FILE_NAME: &str = "gitops-promotion.yaml";

/// Parses and validates a configuration from raw YAML bytes.
pub fn load(bytes: &[u8]) -> Result<Configuration> {
    let cfg: Configuration = serde_yaml::from_slice(bytes)
        .map_err(|e| Error::InvalidConfig(format!("could not parse {CONFIG_FILE_NAME}: {e}")))?;
    cfg.validate_and_normalize()
}

/// Loads and validates a configuration from a specific file path.
pub fn load_from_file(path: &Path) -> Result<Configuration> {
    let bytes = std::fs::read(path)?;
    load(&bytes)
}

/// Walks upward from `start_dir` through parent directories looking for
/// `gitops-promotion.yaml`, returning the first match. Fails with
/// `NotFound` if the filesystem root is reached without finding one.
pub fn find(start_dir: &Path) -> Result<PathBuf> {
    let mut dir = start_dir.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            return Ok(candidate);
        }
        if !dir.pop() {
            return Err(Error::NotFound(format!(
                "{CONFIG_FILE_NAME} not found in {} or any parent directory",
                start_dir.display()
            )));
        }
    }
}

/// Convenience: discover and load in one step.
pub fn load_from_dir(start_dir: &Path) -> Result<Configuration> {
    let path = find(start_dir)?;
    load_from_file(&path)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
prflow: per-app
status_timeout_minutes: 5
environments:
  - name: dev
    auto: true
  - name: qa
    auto: true
  - name: prod
    auto: false
groups:
  testgroup:
    applications:
      testapp:
        featureLabelSelector:
          app: testapp
"#;

    #[test]
    fn loads_valid_yaml() {
        let cfg = load(SAMPLE.as_bytes()).unwrap();
        assert_eq!(cfg.environments().len(), 3);
        assert!(cfg.is_automated("dev").unwrap());
        assert!(!cfg.is_automated("prod").unwrap());
        assert_eq!(
            cfg.feature_label_selector("testgroup", "testapp")
                .unwrap()
                .get("app")
                .map(String::as_str),
            Some("testapp")
        );
    }

    #[test]
    fn rejects_empty_environments() {
        let yaml = "environments: []\n";
        let err = load(yaml.as_bytes()).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn find_walks_up_parent_directories() {
        let td = tempfile::tempdir().unwrap();
        std::fs::write(td.path().join(CONFIG_FILE_NAME), SAMPLE).unwrap();
        let nested = td.path().join("a").join("b").join("c");
        std::fs::create_dir_all(&nested).unwrap();

        let found = find(&nested).unwrap();
        assert_eq!(found, td.path().join(CONFIG_FILE_NAME));
    }

    #[test]
    fn find_fails_when_no_config_exists() {
        let td = tempfile::tempdir().unwrap();
        assert!(find(td.path()).is_err());
    }
}
