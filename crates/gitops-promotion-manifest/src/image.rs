use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;

use gitops_promotion_types::Result;

/// Rewrites every image reference under `root` bound to the policy
/// `{group}:{app}`, in place. Two marker shapes are recognised:
///
/// - `image: repo:oldtag # {"$imagepolicy": "group:app"}` — the tag
///   segment after the last `:` in the value is replaced.
/// - `tag: "oldtag" # {"$imagepolicy": "group:app:tag"}` — the quoted
///   scalar is replaced wholesale.
///
/// Only the matched substring on a matched line changes; every other
/// byte in the tree, including comments and indentation on non-matching
/// lines, passes through untouched. An unquoted numeric value next to a
/// `:tag` marker (e.g. `tag: 1234`) does not match the second pattern
/// and is left as-is — a known gap, not a bug to fix here.
pub fn update_image_tag(root: &Path, app: &str, group: &str, tag: &str) -> Result<()> {
    let image_re = marker_regex(group, app, false);
    let tag_re = marker_regex(group, app, true);

    for path in walk_yaml_files(root)? {
        let original = fs::read_to_string(&path)?;
        let rewritten = rewrite_lines(&original, &image_re, &tag_re, tag);
        if rewritten != original {
            fs::write(&path, rewritten)?;
        }
    }
    Ok(())
}

fn rewrite_lines(content: &str, image_re: &Regex, tag_re: &Regex, tag: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut lines = content.split_inclusive('\n').peekable();
    while let Some(line) = lines.next() {
        let trimmed_end = line.trim_end_matches(['\n', '\r']);
        let line_ending = &line[trimmed_end.len()..];
        if let Some(caps) = image_re.captures(trimmed_end) {
            out.push_str(&caps["prefix"]);
            out.push_str(tag);
            out.push_str(&caps["suffix"]);
        } else if let Some(caps) = tag_re.captures(trimmed_end) {
            out.push_str(&caps["prefix"]);
            out.push_str(tag);
            out.push_str(&caps["suffix"]);
        } else {
            out.push_str(trimmed_end);
        }
        out.push_str(line_ending);
    }
    out
}

/// Builds the regex for one marker shape. `tag_suffix` selects the
/// `:tag`-qualified policy (bare quoted scalar) versus the plain
/// `group:app` policy (trailing segment of an `image:` value).
fn marker_regex(group: &str, app: &str, tag_suffix: bool) -> Regex {
    let group = regex::escape(group);
    let app = regex::escape(app);
    let pattern = if tag_suffix {
        format!(
            r#"^(?P<prefix>.*:\s*")(?P<tag>[^"]*)(?P<suffix>"\s*#\s*\{{"\$imagepolicy":\s*"{group}:{app}:tag"\}}\s*)$"#
        )
    } else {
        format!(
            r#"^(?P<prefix>.*:)(?P<tag>[^:\s]+)(?P<suffix>\s*#\s*\{{"\$imagepolicy":\s*"{group}:{app}"\}}\s*)$"#
        )
    };
    // Both patterns are built from a fixed template plus escaped input;
    // a malformed pattern here would be a programming error, not a
    // runtime condition a caller can recover from.
    Regex::new(&pattern).expect("policy marker pattern is always valid")
}

fn walk_yaml_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    walk_yaml_files_into(root, &mut out)?;
    Ok(out)
}

fn walk_yaml_files_into(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            walk_yaml_files_into(&path, out)?;
        } else if matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        ) {
            out.push(path);
        }
    }
    Ok(())
}
