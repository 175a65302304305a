use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::Serialize;
use serde_yaml::Value;

use gitops_promotion_types::{Error, Result};

/// Label key kustomize-patched resources carry so a later
/// `duplicate_application` pass can tell an already-forked feature
/// overlay apart from the base resources it was forked from, and never
/// re-forks it.
const FEATURE_LABEL_KEY: &str = "feature-label";

const RESOURCE_EXTENSIONS: [&str; 2] = ["yaml", "yml"];

/// Forks the resources in `{root}/{group}/{env}` matching `label_selector`
/// (and not already carrying [`FEATURE_LABEL_KEY`]) into a new
/// `{app}-{feature}` overlay, patching `Ingress` hosts and `Deployment`
/// image tags along the way, then wires the overlay into the
/// environment's aggregate `kustomization.yaml`.
pub fn duplicate_application(
    root: &Path,
    group: &str,
    env: &str,
    app: &str,
    tag: &str,
    feature: &str,
    label_selector: &BTreeMap<String, String>,
) -> Result<()> {
    let env_dir = root.join(group).join(env);
    let target_dir_name = format!("{app}-{feature}");
    let target_dir = env_dir.join(&target_dir_name);

    if target_dir.exists() {
        fs::remove_dir_all(&target_dir)?;
    }
    fs::create_dir_all(&target_dir)?;

    let mut written = Vec::new();
    for path in resource_files(&env_dir)? {
        let content = fs::read_to_string(&path)?;
        let mut doc: Value = match serde_yaml::from_str(&content) {
            Ok(v) => v,
            Err(_) => continue, // not a single-document k8s resource (e.g. the aggregate file itself)
        };
        if !matches_selector(&doc, label_selector) || has_feature_label(&doc) {
            continue;
        }
        patch_resource(&mut doc, feature, tag);

        let filename = resource_filename(&doc)?;
        let out_path = target_dir.join(&filename);
        let rendered = serde_yaml::to_string(&doc)
            .map_err(|e| Error::Permanent(format!("could not render patched resource: {e}")))?;
        fs::write(&out_path, rendered)?;
        written.push(filename);
    }
    written.sort();

    write_overlay_kustomization(&target_dir, feature, label_selector, &written)?;

    let parent_kustomization = env_dir.join("kustomization.yaml");
    if parent_kustomization.exists() {
        append_resource_entry(&parent_kustomization, &target_dir_name)?;
    }
    Ok(())
}

/// Deletes `{root}/{group}/{env}/{app}-{feature}` and drops its entry
/// from the environment's aggregate `kustomization.yaml`.
pub fn remove_application(root: &Path, group: &str, env: &str, app: &str, feature: &str) -> Result<()> {
    let env_dir = root.join(group).join(env);
    let target_dir_name = format!("{app}-{feature}");
    let target_dir = env_dir.join(&target_dir_name);
    if target_dir.exists() {
        fs::remove_dir_all(&target_dir)?;
    }

    let parent_kustomization = env_dir.join("kustomization.yaml");
    if parent_kustomization.exists() {
        remove_resource_entry(&parent_kustomization, &target_dir_name)?;
    }
    Ok(())
}

fn resource_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_file()
            && path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|ext| RESOURCE_EXTENSIONS.contains(&ext))
            && path.file_name().and_then(|n| n.to_str()) != Some("kustomization.yaml")
        {
            out.push(path);
        }
    }
    Ok(out)
}

fn matches_selector(doc: &Value, label_selector: &BTreeMap<String, String>) -> bool {
    if label_selector.is_empty() {
        return true;
    }
    let Some(labels) = doc.get("metadata").and_then(|m| m.get("labels")) else {
        return false;
    };
    label_selector
        .iter()
        .all(|(k, v)| labels.get(k.as_str()).and_then(Value::as_str) == Some(v.as_str()))
}

fn has_feature_label(doc: &Value) -> bool {
    doc.get("metadata")
        .and_then(|m| m.get("labels"))
        .and_then(|labels| labels.get(FEATURE_LABEL_KEY))
        .is_some()
}

fn patch_resource(doc: &mut Value, feature: &str, tag: &str) {
    let kind = doc.get("kind").and_then(Value::as_str).unwrap_or_default();
    match kind {
        "Ingress" => patch_ingress(doc, feature),
        "Deployment" => patch_deployment(doc, tag),
        _ => {}
    }
}

fn patch_ingress(doc: &mut Value, feature: &str) {
    let prefix = |host: &str| format!("{feature}.{host}");

    if let Some(rules) = doc
        .get_mut("spec")
        .and_then(|s| s.get_mut("rules"))
        .and_then(Value::as_sequence_mut)
    {
        for rule in rules {
            if let Some(host) = rule.get("host").and_then(Value::as_str).map(str::to_string) {
                rule["host"] = Value::from(prefix(&host));
            }
        }
    }
    if let Some(tls) = doc
        .get_mut("spec")
        .and_then(|s| s.get_mut("tls"))
        .and_then(Value::as_sequence_mut)
    {
        for entry in tls {
            if let Some(hosts) = entry.get_mut("hosts").and_then(Value::as_sequence_mut) {
                for host in hosts.iter_mut() {
                    if let Some(h) = host.as_str().map(str::to_string) {
                        *host = Value::from(prefix(&h));
                    }
                }
            }
        }
    }
}

fn patch_deployment(doc: &mut Value, tag: &str) {
    let Some(containers) = doc
        .get_mut("spec")
        .and_then(|s| s.get_mut("template"))
        .and_then(|t| t.get_mut("spec"))
        .and_then(|s| s.get_mut("containers"))
        .and_then(Value::as_sequence_mut)
    else {
        return;
    };
    for container in containers {
        let Some(image) = container.get("image").and_then(Value::as_str).map(str::to_string)
        else {
            continue;
        };
        let repo = image.rsplit_once(':').map_or(image.as_str(), |(repo, _)| repo);
        let new_image = format!("{repo}:{tag}");
        container["image"] = Value::from(new_image);
    }
}

fn resource_filename(doc: &Value) -> Result<String> {
    let api_version = doc
        .get("apiVersion")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Permanent("resource missing apiVersion".to_string()))?;
    let kind = doc
        .get("kind")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Permanent("resource missing kind".to_string()))?;
    let namespace = doc
        .get("metadata")
        .and_then(|m| m.get("namespace"))
        .and_then(Value::as_str)
        .unwrap_or("default");
    let name = doc
        .get("metadata")
        .and_then(|m| m.get("name"))
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Permanent("resource missing metadata.name".to_string()))?;

    let gvk = match api_version.split_once('/') {
        Some((group, version)) => format!("{group}-{version}-{kind}"),
        None => format!("{api_version}-{kind}"),
    };
    Ok(format!("{}-{namespace}-{name}.yaml", gvk.to_lowercase()))
}

#[derive(Serialize)]
struct OverlayKustomization {
    #[serde(rename = "nameSuffix")]
    name_suffix: String,
    #[serde(rename = "commonLabels")]
    common_labels: BTreeMap<String, String>,
    resources: Vec<String>,
}

fn write_overlay_kustomization(
    target_dir: &Path,
    feature: &str,
    label_selector: &BTreeMap<String, String>,
    resources: &[String],
) -> Result<()> {
    let mut common_labels = BTreeMap::new();
    common_labels.insert(FEATURE_LABEL_KEY.to_string(), feature.to_string());
    for (k, v) in label_selector {
        common_labels.insert(k.clone(), format!("{v}-{feature}"));
    }

    let overlay = OverlayKustomization {
        name_suffix: format!("-{feature}"),
        common_labels,
        resources: resources.to_vec(),
    };
    let rendered = serde_yaml::to_string(&overlay)
        .map_err(|e| Error::Permanent(format!("could not render overlay kustomization: {e}")))?;
    fs::write(target_dir.join("kustomization.yaml"), rendered)?;
    Ok(())
}

fn list_item_regex() -> Regex {
    Regex::new(r#"^(?P<indent>\s*)-\s*"?(?P<value>[^"\n]*?)"?\s*$"#).expect("static pattern")
}

fn resources_header_regex() -> Regex {
    Regex::new(r"^(?P<indent>\s*)resources:\s*$").expect("static pattern")
}

/// Locates the `resources:` block in `path` and inserts `- {entry}`
/// immediately after its last existing item, matching the indentation of
/// the other items (or, if the block is empty, indenting two spaces past
/// the header). Every other line is left untouched.
fn append_resource_entry(path: &Path, entry: &str) -> Result<()> {
    let content = fs::read_to_string(path)?;
    let lines: Vec<&str> = content.split_inclusive('\n').collect();
    let header_re = resources_header_regex();
    let item_re = list_item_regex();

    let Some(header_idx) = lines
        .iter()
        .position(|l| header_re.is_match(l.trim_end_matches(['\n', '\r'])))
    else {
        return Err(Error::Permanent(format!(
            "{} has no top-level resources: block",
            path.display()
        )));
    };

    let header_indent = header_re
        .captures(lines[header_idx].trim_end_matches(['\n', '\r']))
        .map(|c| c["indent"].to_string())
        .unwrap_or_default();

    let mut insert_at = header_idx + 1;
    let mut item_indent = format!("{header_indent}  ");
    while insert_at < lines.len() {
        let trimmed = lines[insert_at].trim_end_matches(['\n', '\r']);
        match item_re.captures(trimmed) {
            Some(caps) if trimmed.starts_with(&caps["indent"]) && trimmed.trim_start().starts_with('-') => {
                item_indent = caps["indent"].to_string();
                insert_at += 1;
            }
            _ => break,
        }
    }

    let mut out = String::with_capacity(content.len() + entry.len() + item_indent.len() + 4);
    for line in &lines[..insert_at] {
        out.push_str(line);
    }
    out.push_str(&format!("{item_indent}- {entry}\n"));
    for line in &lines[insert_at..] {
        out.push_str(line);
    }
    fs::write(path, out)?;
    Ok(())
}

/// Inverse of [`append_resource_entry`]: removes the line `- {entry}`
/// from the `resources:` block, leaving every other line untouched.
fn remove_resource_entry(path: &Path, entry: &str) -> Result<()> {
    let content = fs::read_to_string(path)?;
    let item_re = list_item_regex();
    let mut out = String::with_capacity(content.len());
    for line in content.split_inclusive('\n') {
        let trimmed = line.trim_end_matches(['\n', '\r']);
        if let Some(caps) = item_re.captures(trimmed) {
            if caps["value"] == *entry {
                continue;
            }
        }
        out.push_str(line);
    }
    fs::write(path, out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, content: &str) {
        fs::write(dir.join(name), content).unwrap();
    }

    fn sample_env(td: &Path) -> PathBuf {
        let env_dir = td.join("team1").join("dev");
        fs::create_dir_all(&env_dir).unwrap();
        write(
            &env_dir,
            "deployment.yaml",
            "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: app1\n  labels:\n    app: app1\nspec:\n  template:\n    spec:\n      containers:\n        - name: app1\n          image: app1:v1.0.0\n",
        );
        write(
            &env_dir,
            "ingress.yaml",
            "apiVersion: networking.k8s.io/v1\nkind: Ingress\nmetadata:\n  name: app1\n  labels:\n    app: app1\nspec:\n  rules:\n    - host: app1.example.com\n  tls:\n    - hosts:\n        - app1.example.com\n",
        );
        write(
            &env_dir,
            "kustomization.yaml",
            "resources:\n  - deployment.yaml\n  - ingress.yaml\n",
        );
        env_dir
    }

    #[test]
    fn duplicate_application_patches_and_registers_overlay() {
        let td = tempfile::tempdir().unwrap();
        let env_dir = sample_env(td.path());
        let mut selector = BTreeMap::new();
        selector.insert("app".to_string(), "app1".to_string());

        duplicate_application(td.path(), "team1", "dev", "app1", "v1.0.1", "pr42", &selector).unwrap();

        let overlay_dir = env_dir.join("app1-pr42");
        assert!(overlay_dir.join("kustomization.yaml").exists());

        let deployment = fs::read_to_string(
            overlay_dir
                .join("apps-v1-deployment-default-app1.yaml"),
        )
        .unwrap();
        assert!(deployment.contains("app1:v1.0.1"));

        let ingress = fs::read_to_string(overlay_dir.join(
            "networking.k8s.io-v1-ingress-default-app1.yaml",
        ))
        .unwrap();
        assert!(ingress.contains("pr42.app1.example.com"));

        let parent = fs::read_to_string(env_dir.join("kustomization.yaml")).unwrap();
        assert!(parent.contains("- app1-pr42"));
        assert!(parent.contains("- deployment.yaml"));
    }

    #[test]
    fn remove_application_deletes_dir_and_parent_entry() {
        let td = tempfile::tempdir().unwrap();
        let env_dir = sample_env(td.path());
        let mut selector = BTreeMap::new();
        selector.insert("app".to_string(), "app1".to_string());
        duplicate_application(td.path(), "team1", "dev", "app1", "v1.0.1", "pr42", &selector).unwrap();

        remove_application(td.path(), "team1", "dev", "app1", "pr42").unwrap();

        assert!(!env_dir.join("app1-pr42").exists());
        let parent = fs::read_to_string(env_dir.join("kustomization.yaml")).unwrap();
        assert!(!parent.contains("app1-pr42"));
        assert!(parent.contains("- deployment.yaml"));
    }

    #[test]
    fn resources_already_carrying_the_feature_label_are_skipped() {
        let td = tempfile::tempdir().unwrap();
        let env_dir = sample_env(td.path());
        write(
            &env_dir,
            "already-forked.yaml",
            "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: app1-other\n  labels:\n    app: app1\n    feature-label: other\nspec:\n  template:\n    spec:\n      containers: []\n",
        );
        let mut selector = BTreeMap::new();
        selector.insert("app".to_string(), "app1".to_string());

        duplicate_application(td.path(), "team1", "dev", "app1", "v1.0.1", "pr42", &selector).unwrap();

        let overlay_dir = env_dir.join("app1-pr42");
        assert!(overlay_dir.join("apps-v1-deployment-default-app1.yaml").exists());
        assert!(!overlay_dir.join("apps-v1-deployment-default-app1-other.yaml").exists());
    }
}
