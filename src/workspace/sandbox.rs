//! Path containment for session workspaces
//!
//! Every session owns exactly one directory directly under the workspace
//! root. All paths handed out by [`PathSandbox`] are re-verified against the
//! canonical root on each call, so symlinks planted by cloned or extracted
//! content cannot redirect a later operation outside the sandbox.

use super::error::{WorkspaceError, WorkspaceResult};
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Resolves session ids to directories guaranteed to live under one root
#[derive(Debug, Clone)]
pub struct PathSandbox {
    root: PathBuf,
}

impl PathSandbox {
    /// Create the sandbox, creating the root directory if it is absent
    pub fn new(root: impl AsRef<Path>) -> WorkspaceResult<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root).map_err(|e| {
            WorkspaceError::io(format!("Failed to create workspace root {}", root.display()), e)
        })?;
        let root = root.canonicalize().map_err(|e| {
            WorkspaceError::io(
                format!("Failed to canonicalize workspace root {}", root.display()),
                e,
            )
        })?;
        debug!("Workspace root: {}", root.display());
        Ok(Self { root })
    }

    /// Canonical workspace root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve the workspace directory for a session without creating it
    pub fn resolve(&self, session_id: &str) -> WorkspaceResult<PathBuf> {
        let segment = validate_segment(session_id)?;
        verify_inside(&self.root, self.root.join(segment), session_id)
    }

    /// Resolve the workspace directory for a session, creating it if needed
    pub fn ensure(&self, session_id: &str) -> WorkspaceResult<PathBuf> {
        let dir = self.resolve(session_id)?;
        fs::create_dir_all(&dir).map_err(|e| {
            WorkspaceError::io(format!("Failed to create workspace {}", dir.display()), e)
        })?;
        // Re-check now that the directory exists and can be canonicalized
        self.resolve(session_id)
    }

    /// Resolve a checkout directory directly under a session workspace
    pub fn resolve_checkout(&self, session_id: &str, repo_name: &str) -> WorkspaceResult<PathBuf> {
        let workspace = self.resolve(session_id)?;
        let segment = validate_segment(repo_name)?;
        let base = canonical_or_self(&workspace);
        verify_inside(&base, workspace.join(segment), repo_name)
    }

    /// Resolve a checkout root recorded relative to the session workspace.
    ///
    /// An empty relative path designates the workspace itself (flat archives).
    pub fn contain(&self, session_id: &str, relative: &Path) -> WorkspaceResult<PathBuf> {
        if relative.as_os_str().is_empty() {
            return self.resolve(session_id);
        }
        let name = relative
            .to_str()
            .ok_or_else(|| WorkspaceError::path_escape(relative.display()))?;
        self.resolve_checkout(session_id, name)
    }

    /// Recursively delete a session workspace; never fails
    pub fn delete(&self, session_id: &str) -> DeletionReport {
        match self.resolve(session_id) {
            Ok(dir) => best_effort_delete(&dir),
            Err(e) => {
                warn!("Refusing to delete workspace for session {:?}: {}", session_id, e);
                DeletionReport::new(&self.root)
            }
        }
    }

    /// Delete every entry under the root, keeping (or recreating) the root itself
    pub fn delete_all(&self) -> DeletionReport {
        let mut report = DeletionReport::new(&self.root);

        if let Err(e) = fs::create_dir_all(&self.root) {
            report.record(&self.root, e.to_string());
            return report;
        }

        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                report.record(&self.root, e.to_string());
                return report;
            }
        };

        for entry in entries {
            match entry {
                Ok(entry) => report.merge(best_effort_delete(&entry.path())),
                Err(e) => report.record(&self.root, e.to_string()),
            }
        }

        report
    }
}

/// Accept exactly one normal path segment
pub(crate) fn validate_segment(value: &str) -> WorkspaceResult<&str> {
    if value.is_empty() || value.contains(['\0', '/', '\\']) {
        return Err(WorkspaceError::path_escape(value.escape_debug()));
    }

    let mut components = Path::new(value).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(value),
        _ => Err(WorkspaceError::path_escape(value.escape_debug())),
    }
}

/// Check that `candidate` resolves to a strict descendant of `base`
fn verify_inside(base: &Path, candidate: PathBuf, label: &str) -> WorkspaceResult<PathBuf> {
    let resolved = match fs::symlink_metadata(&candidate) {
        Ok(_) => candidate
            .canonicalize()
            .map_err(|_| WorkspaceError::path_escape(label.escape_debug()))?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let parent = candidate
                .parent()
                .ok_or_else(|| WorkspaceError::path_escape(label.escape_debug()))?;
            let parent = parent.canonicalize().map_err(|e| {
                WorkspaceError::io(format!("Failed to resolve {}", parent.display()), e)
            })?;
            match candidate.file_name() {
                Some(name) => parent.join(name),
                None => return Err(WorkspaceError::path_escape(label.escape_debug())),
            }
        }
        Err(e) => {
            return Err(WorkspaceError::io(
                format!("Failed to inspect {}", candidate.display()),
                e,
            ))
        }
    };

    if resolved != base && resolved.starts_with(base) {
        Ok(candidate)
    } else {
        Err(WorkspaceError::path_escape(label.escape_debug()))
    }
}

fn canonical_or_self(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

/// A single entry that could not be removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionFailure {
    pub path: PathBuf,
    pub error: String,
}

/// Outcome of a best-effort recursive deletion
#[derive(Debug, Clone, Default)]
pub struct DeletionReport {
    pub target: PathBuf,
    pub removed: usize,
    pub failures: Vec<DeletionFailure>,
}

impl DeletionReport {
    pub fn new(target: &Path) -> Self {
        Self {
            target: target.to_path_buf(),
            removed: 0,
            failures: Vec::new(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(&mut self, path: &Path, error: String) {
        self.failures.push(DeletionFailure {
            path: path.to_path_buf(),
            error,
        });
    }

    pub fn merge(&mut self, other: DeletionReport) {
        self.removed += other.removed;
        self.failures.extend(other.failures);
    }

    /// Convert into a result, reporting leftover entries as a partial failure
    pub fn into_result(self) -> WorkspaceResult<usize> {
        if self.failures.is_empty() {
            Ok(self.removed)
        } else {
            Err(WorkspaceError::TeardownPartialFailure {
                path: self.target,
                failures: self.failures.len(),
            })
        }
    }

    /// Emit one log line summarizing the deletion
    pub fn log(&self, what: &str) {
        if self.is_clean() {
            debug!(
                "Removed {} entries for {} ({})",
                self.removed,
                what,
                self.target.display()
            );
        } else {
            let first = &self.failures[0];
            warn!(
                "Partial cleanup of {} ({}): {} entries left, first {}: {}",
                what,
                self.target.display(),
                self.failures.len(),
                first.path.display(),
                first.error
            );
        }
    }
}

/// Delete a file or directory tree without ever failing the caller.
///
/// The walk never follows symlinks. An entry that cannot be removed because
/// of permissions gets its read-only bit (and its parent's) cleared and is
/// retried once; anything still failing is recorded in the report.
pub fn best_effort_delete(path: &Path) -> DeletionReport {
    let mut report = DeletionReport::new(path);
    delete_tree(path, true, &mut report);
    report
}

fn delete_tree(path: &Path, allow_retry: bool, report: &mut DeletionReport) {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return,
        Err(e) => {
            report.record(path, e.to_string());
            return;
        }
    };

    if !metadata.is_dir() {
        remove_entry(path, false, report);
        return;
    }

    let walker = WalkDir::new(path)
        .follow_links(false)
        .follow_root_links(false)
        .contents_first(true);

    for entry in walker {
        match entry {
            Ok(entry) => remove_entry(entry.path(), entry.file_type().is_dir(), report),
            Err(e) => {
                let failed = e.path().unwrap_or(path).to_path_buf();
                let denied = e
                    .io_error()
                    .is_some_and(|io| io.kind() == io::ErrorKind::PermissionDenied);
                if denied && allow_retry {
                    make_writable(&failed);
                    delete_tree(&failed, false, report);
                } else {
                    report.record(&failed, e.to_string());
                }
            }
        }
    }
}

fn remove_entry(path: &Path, is_dir: bool, report: &mut DeletionReport) {
    match remove(path, is_dir) {
        Ok(()) => report.removed += 1,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            make_writable(path);
            if let Some(parent) = path.parent() {
                make_writable(parent);
            }
            match remove(path, is_dir) {
                Ok(()) => report.removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => report.record(path, e.to_string()),
            }
        }
        Err(e) => report.record(path, e.to_string()),
    }
}

fn remove(path: &Path, is_dir: bool) -> io::Result<()> {
    if is_dir {
        fs::remove_dir(path)
    } else {
        fs::remove_file(path)
    }
}

#[cfg(unix)]
fn make_writable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Ok(metadata) = fs::symlink_metadata(path) {
        if metadata.file_type().is_symlink() {
            return;
        }
        let mut permissions = metadata.permissions();
        let extra = if metadata.is_dir() { 0o700 } else { 0o600 };
        permissions.set_mode(permissions.mode() | extra);
        let _ = fs::set_permissions(path, permissions);
    }
}

#[cfg(not(unix))]
fn make_writable(path: &Path) {
    if let Ok(metadata) = fs::symlink_metadata(path) {
        let mut permissions = metadata.permissions();
        #[allow(clippy::permissions_set_readonly_false)]
        permissions.set_readonly(false);
        let _ = fs::set_permissions(path, permissions);
    }
}
