//! Edits the checked-out manifest tree on behalf of the dispatcher:
//! rewriting image tags bound to a policy marker, and forking or removing
//! a per-feature kustomize overlay.
//!
//! Every edit here is line-oriented rather than tree-aware. No crate in
//! the workspace's dependency graph parses YAML back into a
//! comment-and-formatting-preserving node tree the way `toml_edit` does
//! for TOML, so a host manifest's unrelated bytes are preserved by never
//! reading the file as a structured document in the first place — only
//! the matched lines are touched.

mod image;
mod kustomization;

pub use image::update_image_tag;
pub use kustomization::{duplicate_application, remove_application};
