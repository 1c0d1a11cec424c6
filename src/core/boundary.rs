//! Writable-path boundaries.
//!
//! Paths proposed by producers are normalized, checked for escapes, and then
//! matched against per-kind allow and deny lists. A pattern containing `*`
//! is a glob; anything else is a plain prefix, so allowlist entries should
//! end in `/` to cover a directory.

use serde::{Deserialize, Serialize};

/// Normalizes a relative path: `\` becomes `/` and leading `./` is dropped.
#[must_use]
pub fn normalize_path(path: &str) -> String {
    let unified = path.trim().replace('\\', "/");
    let mut rest = unified.as_str();
    while let Some(stripped) = rest.strip_prefix("./") {
        rest = stripped;
    }
    rest.to_string()
}

/// A path rejected before allowlist matching.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("empty path")]
    Empty,
    #[error("absolute path not allowed: {0}")]
    Absolute(String),
    #[error("path traversal forbidden: {0}")]
    Traversal(String),
}

/// Normalizes `path` and refuses anything that could leave the workspace.
pub fn safe_relative_path(path: &str) -> Result<String, PathError> {
    let norm = normalize_path(path);
    if norm.is_empty() || norm == "." {
        return Err(PathError::Empty);
    }
    let drive_letter = norm.as_bytes().get(1) == Some(&b':');
    if norm.starts_with('/') || drive_letter {
        return Err(PathError::Absolute(path.to_string()));
    }
    if norm.split('/').any(|part| part == "..") {
        return Err(PathError::Traversal(path.to_string()));
    }
    Ok(norm)
}

/// Checks a normalized path against a boundary pattern.
#[must_use]
pub fn pattern_matches(pattern: &str, path: &str) -> bool {
    let pattern = normalize_path(pattern);
    if pattern.contains('*') {
        glob_match(&pattern, path)
    } else {
        path.starts_with(&pattern)
    }
}

/// Simple glob matching (supports `*` and `**`).
fn glob_match(pattern: &str, path: &str) -> bool {
    if pattern == "**" || pattern == "*" {
        return true;
    }
    if let Some((prefix, suffix)) = pattern.split_once("**") {
        let prefix = prefix.trim_end_matches('/');
        let suffix = suffix.trim_start_matches('/');
        // The prefix must end on a segment boundary.
        let rest = if prefix.is_empty() {
            path
        } else {
            match path.strip_prefix(prefix) {
                Some("") => "",
                Some(rest) => match rest.strip_prefix('/') {
                    Some(rest) => rest,
                    None => return false,
                },
                None => return false,
            }
        };
        if suffix.is_empty() || suffix == "*" {
            return true;
        }
        if let Some(ext) = suffix.strip_prefix("*.") {
            return rest.ends_with(&format!(".{ext}"));
        }
        return rest.ends_with(suffix);
    }
    if let Some(prefix) = pattern.strip_suffix("/*") {
        return path
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('/'))
            .is_some_and(|rest| !rest.is_empty() && !rest.contains('/'));
    }
    if let Some(ext) = pattern.strip_prefix("*.") {
        return !path.contains('/') && path.ends_with(&format!(".{ext}"));
    }
    if let Some(suffix) = pattern.strip_prefix("*/") {
        return path.ends_with(suffix);
    }
    pattern == path
}

/// Read/write boundary for one task kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindBoundary {
    #[serde(default)]
    pub read: Vec<String>,
    #[serde(default)]
    pub write: Vec<String>,
    #[serde(default)]
    pub forbidden_write: Vec<String>,
}

/// Why a write was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BoundaryError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("path not allowed for {kind}: {path}")]
    OutsideAllowlist { kind: String, path: String },
    #[error("path explicitly forbidden: {0}")]
    Forbidden(String),
    #[error("hotfix task has no scope_patch")]
    MissingScopePatch,
    #[error("path outside scope_patch: {0}")]
    OutsideScopePatch(String),
}

impl KindBoundary {
    #[must_use]
    pub fn new(write: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            read: Vec::new(),
            write: write.into_iter().map(Into::into).collect(),
            forbidden_write: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_read(mut self, read: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.read = read.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn forbid(mut self, pattern: impl Into<String>) -> Self {
        self.forbidden_write.push(pattern.into());
        self
    }

    /// Checks one proposed write, returning the normalized path.
    ///
    /// `scope_patch` is the narrower prefix list of a hotfix task, if the
    /// task is a hotfix and patch scoping is enabled.
    pub fn check_write(
        &self,
        kind: &str,
        path: &str,
        scope_patch: Option<&[String]>,
    ) -> Result<String, BoundaryError> {
        let path = safe_relative_path(path)?;
        if !self.write.iter().any(|p| pattern_matches(p, &path)) {
            return Err(BoundaryError::OutsideAllowlist {
                kind: kind.to_string(),
                path,
            });
        }
        if self.forbidden_write.iter().any(|p| pattern_matches(p, &path)) {
            return Err(BoundaryError::Forbidden(path));
        }
        if let Some(prefixes) = scope_patch {
            if prefixes.is_empty() {
                return Err(BoundaryError::MissingScopePatch);
            }
            if !prefixes
                .iter()
                .any(|prefix| path.starts_with(&normalize_path(prefix)))
            {
                return Err(BoundaryError::OutsideScopePatch(path));
            }
        }
        Ok(path)
    }
}
