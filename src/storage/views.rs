//! Materialized view persistence and validated file writes.
//!
//! Views are derived data: they are overwritten wholesale after every
//! projection and never edited in place. The stored roadmap is read back as
//! loose JSON so the verifier can compare it even when it has been tampered
//! with.

use crate::core::projection::Views;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const ROADMAP_FILE: &str = "roadmap.json";
pub const ISSUES_FILE: &str = "issues.json";
pub const LESSONS_FILE: &str = "lessons.json";

#[derive(Debug, thiserror::Error)]
pub enum ViewStoreError {
    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid view JSON in {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl ViewStoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn json(path: &Path, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.to_path_buf(),
            source,
        }
    }

    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Io { .. } => "view_io_error",
            Self::Json { .. } => "view_invalid_json",
        }
    }
}

pub type Result<T> = std::result::Result<T, ViewStoreError>;

/// Where materialized views and accepted file updates land.
pub trait ViewStore {
    /// The stored roadmap document, `None` if it was never written.
    fn load_roadmap(&self) -> Result<Option<Value>>;

    /// Replaces all three views.
    fn save(&mut self, views: &Views) -> Result<()>;

    /// Prepares one validated file update (path already normalized) without
    /// making it visible. Fails if the update could not be written.
    fn stage_file(&mut self, path: &str, content: &str) -> Result<()>;

    /// Makes every staged update visible; returns how many were applied.
    fn publish_staged(&mut self) -> Result<usize>;

    /// Drops staged updates that were never published.
    fn discard_staged(&mut self);
}

impl<T: ViewStore + ?Sized> ViewStore for Box<T> {
    fn load_roadmap(&self) -> Result<Option<Value>> {
        (**self).load_roadmap()
    }

    fn save(&mut self, views: &Views) -> Result<()> {
        (**self).save(views)
    }

    fn stage_file(&mut self, path: &str, content: &str) -> Result<()> {
        (**self).stage_file(path, content)
    }

    fn publish_staged(&mut self) -> Result<usize> {
        (**self).publish_staged()
    }

    fn discard_staged(&mut self) {
        (**self).discard_staged();
    }
}

/// Pretty JSON with a trailing newline.
pub fn render_pretty<T: Serialize>(value: &T) -> serde_json::Result<String> {
    let mut text = serde_json::to_string_pretty(value)?;
    text.push('\n');
    Ok(text)
}

/// Views under `<root>/.roadmap/`, file updates under `<root>/`.
#[derive(Debug, Clone)]
pub struct FileViewStore {
    root: PathBuf,
    view_dir: PathBuf,
    /// `(temp, target)` pairs awaiting rename.
    staged: Vec<(PathBuf, PathBuf)>,
}

impl FileViewStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, view_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            view_dir: view_dir.into(),
            staged: Vec::new(),
        }
    }

    #[must_use]
    pub fn roadmap_path(&self) -> PathBuf {
        self.view_dir.join(ROADMAP_FILE)
    }

    fn write_json<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let path = self.view_dir.join(name);
        let text = render_pretty(value).map_err(|e| ViewStoreError::json(&path, e))?;
        write_atomic(&path, text.as_bytes())
    }
}

/// Writes through a sibling temp file and renames over the target.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = write_temp(path, bytes)?;
    fs::rename(&tmp, path).map_err(|e| ViewStoreError::io(path, e))
}

/// Writes `bytes` to `<path>.tmp`, creating parent directories. The target
/// itself must not be a directory.
fn write_temp(path: &Path, bytes: &[u8]) -> Result<PathBuf> {
    if path.is_dir() {
        return Err(ViewStoreError::io(
            path,
            std::io::Error::other("target is a directory"),
        ));
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| ViewStoreError::io(parent, e))?;
    }
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let mut file = fs::File::create(&tmp).map_err(|e| ViewStoreError::io(&tmp, e))?;
    file.write_all(bytes)
        .and_then(|()| file.sync_all())
        .map_err(|e| ViewStoreError::io(&tmp, e))?;
    Ok(tmp)
}

impl ViewStore for FileViewStore {
    fn load_roadmap(&self) -> Result<Option<Value>> {
        let path = self.roadmap_path();
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ViewStoreError::io(&path, e)),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| ViewStoreError::json(&path, e))
    }

    fn save(&mut self, views: &Views) -> Result<()> {
        self.write_json(ROADMAP_FILE, &views.roadmap)?;
        self.write_json(ISSUES_FILE, &views.issues)?;
        self.write_json(LESSONS_FILE, &views.lessons)?;
        debug!(
            last_event_seq = views.last_event_seq(),
            dir = %self.view_dir.display(),
            "views saved"
        );
        Ok(())
    }

    fn stage_file(&mut self, path: &str, content: &str) -> Result<()> {
        let target = self.root.join(path);
        let tmp = write_temp(&target, content.as_bytes())?;
        debug!(path, bytes = content.len(), "file update staged");
        self.staged.push((tmp, target));
        Ok(())
    }

    fn publish_staged(&mut self) -> Result<usize> {
        let staged = std::mem::take(&mut self.staged);
        let count = staged.len();
        let mut pending = staged.into_iter();
        while let Some((tmp, target)) = pending.next() {
            if let Err(e) = fs::rename(&tmp, &target) {
                let _ = fs::remove_file(&tmp);
                for (rest, _) in pending {
                    let _ = fs::remove_file(rest);
                }
                return Err(ViewStoreError::io(&target, e));
            }
            debug!(path = %target.display(), "file update applied");
        }
        Ok(count)
    }

    fn discard_staged(&mut self) {
        for (tmp, _) in self.staged.drain(..) {
            let _ = fs::remove_file(tmp);
        }
    }
}

/// Views and files held in memory; used for dry runs and tests.
#[derive(Debug, Clone, Default)]
pub struct InMemoryViewStore {
    roadmap: Option<Value>,
    issues: Option<Value>,
    lessons: Option<Value>,
    files: BTreeMap<String, String>,
    staged: Vec<(String, String)>,
}

impl InMemoryViewStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the stored roadmap, e.g. from the on-disk copy before a dry run.
    #[must_use]
    pub fn with_roadmap(mut self, roadmap: Option<Value>) -> Self {
        self.roadmap = roadmap;
        self
    }

    #[must_use]
    pub const fn files(&self) -> &BTreeMap<String, String> {
        &self.files
    }

    #[must_use]
    pub const fn issues(&self) -> Option<&Value> {
        self.issues.as_ref()
    }

    #[must_use]
    pub const fn lessons(&self) -> Option<&Value> {
        self.lessons.as_ref()
    }
}

impl ViewStore for InMemoryViewStore {
    fn load_roadmap(&self) -> Result<Option<Value>> {
        Ok(self.roadmap.clone())
    }

    fn save(&mut self, views: &Views) -> Result<()> {
        let to_value = |name: &str, value: serde_json::Result<Value>| {
            value.map_err(|e| ViewStoreError::json(Path::new(name), e))
        };
        self.roadmap = Some(to_value(ROADMAP_FILE, serde_json::to_value(&views.roadmap))?);
        self.issues = Some(to_value(ISSUES_FILE, serde_json::to_value(&views.issues))?);
        self.lessons = Some(to_value(LESSONS_FILE, serde_json::to_value(&views.lessons))?);
        Ok(())
    }

    fn stage_file(&mut self, path: &str, content: &str) -> Result<()> {
        self.staged.push((path.to_string(), content.to_string()));
        Ok(())
    }

    fn publish_staged(&mut self) -> Result<usize> {
        let count = self.staged.len();
        self.files.extend(self.staged.drain(..));
        Ok(count)
    }

    fn discard_staged(&mut self) {
        self.staged.clear();
    }
}
