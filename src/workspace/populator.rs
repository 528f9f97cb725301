//! Fills a session workspace from a git remote or an uploaded archive

use super::archive::{self, ExtractionLimits};
use super::error::{WorkspaceError, WorkspaceResult};
use super::run_blocking;
use super::sandbox::{best_effort_delete, PathSandbox};
use super::store::Checkout;
use crate::subprocess::{GitRunner, ProcessError, SubprocessManager};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

const DEFAULT_REPO_NAME: &str = "repository";
const DEFAULT_ARCHIVE_NAME: &str = "archive";
const ARCHIVE_SUFFIXES: &[&str] = &[".tar.gz", ".tgz", ".zip"];

pub struct WorkspacePopulator {
    sandbox: PathSandbox,
    subprocess: SubprocessManager,
    clone_timeout: Duration,
    max_upload_bytes: u64,
    limits: ExtractionLimits,
}

impl WorkspacePopulator {
    pub fn new(
        sandbox: PathSandbox,
        subprocess: SubprocessManager,
        clone_timeout: Duration,
        max_upload_bytes: u64,
    ) -> Self {
        Self {
            sandbox,
            subprocess,
            clone_timeout,
            max_upload_bytes,
            limits: ExtractionLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: ExtractionLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Shallow-clone `repo_url` into `<workspace>/<repo name>`, replacing any
    /// previous checkout of the same name
    pub async fn populate_from_clone(
        &self,
        session_id: &str,
        repo_url: &str,
    ) -> WorkspaceResult<Checkout> {
        let repo_url = validate_repo_url(repo_url)?;
        let repo_name = repo_name_from_url(repo_url);

        let workspace = self.sandbox.ensure(session_id)?;
        let target = self.sandbox.resolve_checkout(session_id, &repo_name)?;

        if target.exists() {
            debug!("Replacing existing checkout {}", target.display());
            let stale = target.clone();
            let report = run_blocking(move || best_effort_delete(&stale)).await?;
            report.log("previous checkout");
            report.into_result()?;
        }

        info!("Cloning {} for session {}", repo_url, session_id);
        let result = self
            .subprocess
            .git()
            .clone_shallow(repo_url, &target, self.clone_timeout)
            .await;

        let failure = match result {
            Ok(output) if output.status.success() => None,
            Ok(output) => Some(output.diagnostic("git clone failed")),
            Err(ProcessError::Timeout(limit)) => {
                Some(format!("git clone timed out after {}s", limit.as_secs()))
            }
            Err(ProcessError::CommandNotFound(program)) => {
                Some(format!("{program} is not installed"))
            }
            Err(e) => Some(e.to_string()),
        };

        if let Some(message) = failure {
            self.discard(&target).await;
            return Err(WorkspaceError::clone_failed(message));
        }

        if !workspace.is_dir() {
            return Err(WorkspaceError::clone_failed(
                "workspace was removed during clone",
            ));
        }
        // Re-verify: the checkout now exists and may itself be a link
        let target = self.sandbox.resolve_checkout(session_id, &repo_name)?;
        if !target.is_dir() {
            return Err(WorkspaceError::clone_failed(format!(
                "clone did not produce {}",
                repo_name
            )));
        }

        info!("Cloned {} into {}", repo_name, target.display());
        Ok(Checkout::directory(repo_name))
    }

    /// Replace the whole workspace with the contents of an archive
    pub async fn populate_from_archive<B>(
        &self,
        session_id: &str,
        bytes: B,
        file_name: Option<&str>,
    ) -> WorkspaceResult<Checkout>
    where
        B: AsRef<[u8]> + Send + 'static,
    {
        let size = bytes.as_ref().len() as u64;
        if size == 0 {
            return Err(WorkspaceError::archive_failed("archive is empty"));
        }
        if size > self.max_upload_bytes {
            return Err(WorkspaceError::archive_failed(format!(
                "archive is {size} bytes, limit is {}",
                self.max_upload_bytes
            )));
        }

        self.clear_workspace(session_id).await?;
        let workspace = self.sandbox.ensure(session_id)?;

        let limits = self.limits;
        let dest = workspace.clone();
        let extracted = match run_blocking(move || {
            archive::extract(bytes.as_ref(), &dest, limits)?;
            archive::single_top_level_dir(&dest)
        })
        .await
        {
            Ok(result) => result,
            Err(e) => Err(e),
        };

        let checkout = match extracted {
            Ok(Some(dir)) => self
                .sandbox
                .resolve_checkout(session_id, &dir)
                .map(|_| Checkout::directory(dir)),
            Ok(None) => Ok(Checkout::workspace_root(archive_name(file_name))),
            Err(e) => Err(e),
        };

        match checkout {
            Ok(checkout) => {
                info!(
                    "Extracted archive {} for session {}",
                    checkout.name, session_id
                );
                Ok(checkout)
            }
            Err(e) => {
                warn!("Archive rejected for session {}: {}", session_id, e);
                if let Err(clear_err) = self.clear_workspace(session_id).await {
                    warn!("Failed to clear workspace after rejected archive: {}", clear_err);
                }
                Err(e)
            }
        }
    }

    /// Remove everything in the session workspace, leaving it empty
    async fn clear_workspace(&self, session_id: &str) -> WorkspaceResult<()> {
        let sandbox = self.sandbox.clone();
        let id = session_id.to_string();
        let report = run_blocking(move || sandbox.delete(&id)).await?;
        report.log("workspace contents");
        report.into_result()?;
        self.sandbox.ensure(session_id)?;
        Ok(())
    }

    async fn discard(&self, target: &Path) {
        let target = target.to_path_buf();
        match run_blocking(move || best_effort_delete(&target)).await {
            Ok(report) => report.log("partial checkout"),
            Err(e) => warn!("Failed to discard partial checkout: {}", e),
        }
    }
}

/// Accept http(s), git, ssh and file URLs plus scp-like `user@host:path`
pub fn validate_repo_url(repo_url: &str) -> WorkspaceResult<&str> {
    let trimmed = repo_url.trim();
    if trimmed.is_empty() {
        return Err(WorkspaceError::clone_failed("repository URL is empty"));
    }
    if trimmed.starts_with('-') {
        return Err(WorkspaceError::clone_failed(format!(
            "invalid repository URL: {trimmed}"
        )));
    }
    if trimmed.chars().any(|c| c.is_control() || c.is_whitespace()) {
        return Err(WorkspaceError::clone_failed(format!(
            "invalid repository URL: {trimmed}"
        )));
    }

    match url::Url::parse(trimmed) {
        Ok(parsed) => match parsed.scheme() {
            "http" | "https" | "git" | "ssh" | "file" => Ok(trimmed),
            scheme => Err(WorkspaceError::clone_failed(format!(
                "unsupported URL scheme: {scheme}"
            ))),
        },
        Err(_) if is_scp_like(trimmed) => Ok(trimmed),
        Err(e) => Err(WorkspaceError::clone_failed(format!(
            "invalid repository URL {trimmed}: {e}"
        ))),
    }
}

fn is_scp_like(value: &str) -> bool {
    match value.split_once(':') {
        Some((host, path)) => {
            let host = host.rsplit('@').next().unwrap_or(host);
            !host.is_empty() && !host.contains('/') && !path.is_empty()
        }
        None => false,
    }
}

/// Last path segment of a repository URL, without a trailing `/` or `.git`
pub fn repo_name_from_url(repo_url: &str) -> String {
    let trimmed = repo_url.trim().trim_end_matches('/');
    let last = trimmed
        .rsplit(['/', ':'])
        .next()
        .unwrap_or_default();
    let name = last.strip_suffix(".git").unwrap_or(last);
    if name.is_empty() {
        DEFAULT_REPO_NAME.to_string()
    } else {
        name.to_string()
    }
}

/// Repository name for a flat archive, derived from the uploaded file name
pub fn archive_name(file_name: Option<&str>) -> String {
    let base = file_name
        .map(|name| name.rsplit(['/', '\\']).next().unwrap_or(name))
        .unwrap_or_default();
    let lower = base.to_ascii_lowercase();
    let stem = ARCHIVE_SUFFIXES
        .iter()
        .find(|suffix| lower.ends_with(*suffix))
        .map_or(base, |suffix| &base[..base.len() - suffix.len()]);

    let sanitized: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let sanitized = sanitized.trim_start_matches('.');

    if sanitized.is_empty() {
        DEFAULT_ARCHIVE_NAME.to_string()
    } else {
        sanitized.to_string()
    }
}
