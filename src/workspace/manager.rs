//! Per-session coordination of sandbox, store and populator

use super::error::{WorkspaceError, WorkspaceResult};
use super::populator::WorkspacePopulator;
use super::run_blocking;
use super::sandbox::{DeletionReport, PathSandbox};
use super::store::{Checkout, SessionStore};
use crate::config::ServerConfig;
use crate::explorer::{self, RepoInventory};
use crate::export::{self, ExportSelection};
use crate::subprocess::SubprocessManager;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Result of analyzing a freshly populated checkout
#[derive(Debug, Clone, Serialize)]
pub struct Analysis {
    pub repo_name: String,
    #[serde(flatten)]
    pub inventory: RepoInventory,
}

/// A rendered Markdown export
#[derive(Debug, Clone, Serialize)]
pub struct RenderedExport {
    pub repo_name: String,
    pub export_file: String,
    pub content: String,
}

/// Facade over the workspace components.
///
/// Operations on one session id are serialized by a per-session lock, so a
/// teardown racing a populate ends either fully torn down or fully
/// populated. Different ids never contend.
pub struct WorkspaceManager {
    sandbox: PathSandbox,
    store: SessionStore,
    populator: WorkspacePopulator,
    heartbeat_timeout: Duration,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Newest heartbeat connection per session
    connections: Mutex<HashMap<String, u64>>,
    next_connection: AtomicU64,
    /// Wall-clock anchor advanced by the monotonic tokio clock
    epoch: (DateTime<Utc>, Instant),
}

impl WorkspaceManager {
    pub fn new(
        sandbox: PathSandbox,
        store: SessionStore,
        populator: WorkspacePopulator,
        heartbeat_timeout: Duration,
    ) -> Self {
        Self {
            sandbox,
            store,
            populator,
            heartbeat_timeout,
            locks: Mutex::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
            next_connection: AtomicU64::new(1),
            epoch: (Utc::now(), Instant::now()),
        }
    }

    /// Build every component from configuration
    pub fn from_config(
        config: &ServerConfig,
        subprocess: SubprocessManager,
    ) -> WorkspaceResult<Self> {
        let sandbox = PathSandbox::new(&config.workspace_root)?;
        let populator = WorkspacePopulator::new(
            sandbox.clone(),
            subprocess,
            config.clone_timeout,
            config.max_archive_bytes,
        );
        Ok(Self::new(
            sandbox,
            SessionStore::new(),
            populator,
            config.heartbeat_timeout,
        ))
    }

    pub fn sandbox(&self) -> &PathSandbox {
        &self.sandbox
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
    }

    /// Current time on the clock used for heartbeats and expiry
    pub fn now(&self) -> DateTime<Utc> {
        let (wall, started) = self.epoch;
        let elapsed = chrono::Duration::from_std(started.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        wall + elapsed
    }

    /// Register a new connection; returns its generation.
    ///
    /// A newer connection for the same id supersedes older ones.
    pub async fn connect(&self, session_id: &str) -> WorkspaceResult<u64> {
        self.sandbox.resolve(session_id)?;
        self.store.touch_at(session_id, self.now()).await;
        let generation = self.next_connection.fetch_add(1, Ordering::Relaxed);
        self.connections
            .lock()
            .await
            .insert(session_id.to_string(), generation);
        info!("Session {} connected (connection {})", session_id, generation);
        Ok(generation)
    }

    /// Tear the session down when connection `generation` closes, unless a
    /// newer connection has taken the id over.
    pub async fn disconnect(&self, session_id: &str, generation: u64) -> bool {
        {
            let connections = self.connections.lock().await;
            if let Some(&current) = connections.get(session_id) {
                if current != generation {
                    debug!(
                        "Connection {} of session {} superseded by {}; keeping session",
                        generation, session_id, current
                    );
                    return false;
                }
            }
        }
        self.teardown(session_id).await
    }

    /// Refresh the liveness timestamp, recreating the session if needed
    pub async fn heartbeat(&self, session_id: &str) -> WorkspaceResult<()> {
        self.sandbox.resolve(session_id)?;
        self.store.touch_at(session_id, self.now()).await;
        debug!("Heartbeat from session {}", session_id);
        Ok(())
    }

    /// Clone `repo_url` into the session and inventory the checkout
    pub async fn analyze(&self, session_id: &str, repo_url: &str) -> WorkspaceResult<Analysis> {
        self.sandbox.resolve(session_id)?;
        let lock = self.lock_for(session_id).await;
        let result = {
            let _guard = lock.lock().await;
            self.store.touch_at(session_id, self.now()).await;

            match self.populator.populate_from_clone(session_id, repo_url).await {
                Ok(checkout) => {
                    let analysis = self.inventory(session_id, &checkout).await;
                    if analysis.is_ok() {
                        self.store.record_repo(session_id, &checkout).await;
                    }
                    analysis
                }
                Err(e) => Err(e),
            }
        };
        self.release_lock(session_id, lock).await;
        result
    }

    /// Replace the session workspace with an uploaded archive and inventory it
    pub async fn analyze_archive<B>(
        &self,
        session_id: &str,
        bytes: B,
        file_name: Option<&str>,
    ) -> WorkspaceResult<Analysis>
    where
        B: AsRef<[u8]> + Send + 'static,
    {
        self.sandbox.resolve(session_id)?;
        let lock = self.lock_for(session_id).await;
        let result = {
            let _guard = lock.lock().await;
            self.store.touch_at(session_id, self.now()).await;

            let analysis = match self
                .populator
                .populate_from_archive(session_id, bytes, file_name)
                .await
            {
                Ok(checkout) => match self.inventory(session_id, &checkout).await {
                    Ok(analysis) => {
                        self.store.replace_repos(session_id, &checkout).await;
                        Ok(analysis)
                    }
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            };
            if analysis.is_err() {
                // The workspace was emptied before extraction; earlier repos are gone
                self.store.forget_repos(session_id).await;
            }
            analysis
        };
        self.release_lock(session_id, lock).await;
        result
    }

    /// Render the selected files of a known repository as Markdown
    pub async fn export(
        &self,
        session_id: &str,
        repo_name: &str,
        selection: ExportSelection,
    ) -> WorkspaceResult<RenderedExport> {
        self.sandbox.resolve(session_id)?;
        let lock = self.lock_for(session_id).await;
        let result = {
            let _guard = lock.lock().await;
            self.render(session_id, repo_name, selection).await
        };
        self.release_lock(session_id, lock).await;
        result
    }

    /// Destroy a session: store record first, then its directory, both
    /// under the session lock.
    ///
    /// Idempotent and infallible; returns whether a record existed.
    pub async fn teardown(&self, session_id: &str) -> bool {
        if self.sandbox.resolve(session_id).is_err() {
            debug!("Ignoring teardown of invalid session id {:?}", session_id);
            return self.store.destroy(session_id).await;
        }

        let lock = self.lock_for(session_id).await;
        let existed = {
            let _guard = lock.lock().await;
            let existed = self.store.destroy(session_id).await;
            let sandbox = self.sandbox.clone();
            let id = session_id.to_string();
            match run_blocking(move || sandbox.delete(&id)).await {
                Ok(report) => report.log(&format!("workspace of session {session_id}")),
                Err(e) => warn!("Teardown of session {} failed: {}", session_id, e),
            }
            existed
        };
        self.connections.lock().await.remove(session_id);
        self.release_lock(session_id, lock).await;

        if existed {
            info!("Session {} torn down", session_id);
        }
        existed
    }

    /// Forget every session and delete every workspace under the root
    pub async fn purge_all(&self) -> DeletionReport {
        let sessions = self.store.clear().await;
        self.connections.lock().await.clear();
        let sandbox = self.sandbox.clone();
        let root = sandbox.root().to_path_buf();
        let report = match run_blocking(move || sandbox.delete_all()).await {
            Ok(report) => report,
            Err(e) => {
                warn!("Purge of {} failed: {}", root.display(), e);
                DeletionReport::new(&root)
            }
        };
        report.log("workspace root");
        info!(
            "Purged {} sessions and {} entries under {}",
            sessions,
            report.removed,
            self.sandbox.root().display()
        );
        report
    }

    /// Sessions whose heartbeat is older than the configured timeout
    pub async fn expired(&self, now: DateTime<Utc>) -> Vec<String> {
        self.store.list_expired(now, self.heartbeat_timeout).await
    }

    pub async fn session_count(&self) -> usize {
        self.store.len().await
    }

    async fn inventory(&self, session_id: &str, checkout: &Checkout) -> WorkspaceResult<Analysis> {
        let root = self.sandbox.contain(session_id, &checkout.relative_root)?;
        let name = checkout.name.clone();
        let inventory = run_blocking(move || explorer::explore(&root, &name))
            .await?
            .map_err(|e| WorkspaceError::io(format!("Failed to explore {}", checkout.name), e))?;
        Ok(Analysis {
            repo_name: checkout.name.clone(),
            inventory,
        })
    }

    async fn render(
        &self,
        session_id: &str,
        repo_name: &str,
        selection: ExportSelection,
    ) -> WorkspaceResult<RenderedExport> {
        let relative = self.store.checkout_root(session_id, repo_name).await?;
        let repo_not_found = || WorkspaceError::RepoNotFound {
            session_id: session_id.to_string(),
            repo_name: repo_name.to_string(),
        };
        // The workspace may have vanished under a recorded checkout
        if !self.sandbox.resolve(session_id)?.is_dir() {
            return Err(repo_not_found());
        }
        let root = self.sandbox.contain(session_id, &relative)?;
        if !root.is_dir() {
            return Err(repo_not_found());
        }

        let name = repo_name.to_string();
        let content = run_blocking(move || -> WorkspaceResult<Option<String>> {
            let files = export::collect_files(&root, &selection)
                .map_err(|e| WorkspaceError::io("Failed to collect export files", e))?;
            if files.is_empty() {
                return Ok(None);
            }
            export::render_markdown(&name, &root, &files)
                .map(Some)
                .map_err(|e| WorkspaceError::io("Failed to render export", e))
        })
        .await??;

        let content = content.ok_or_else(|| WorkspaceError::NothingToExport {
            repo_name: repo_name.to_string(),
        })?;
        debug!(
            "Rendered {} bytes of Markdown for {} in session {}",
            content.len(),
            repo_name,
            session_id
        );

        Ok(RenderedExport {
            repo_name: repo_name.to_string(),
            export_file: export::export_file_name(repo_name),
            content,
        })
    }

    async fn lock_for(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(session_id.to_string()).or_default())
    }

    /// Drop the lock table entry once no other task holds a handle to it
    async fn release_lock(&self, session_id: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().await;
        // One reference in the table, one held here
        if Arc::strong_count(&lock) <= 2 && !self.store.contains(session_id).await {
            locks.remove(session_id);
        }
    }

    #[cfg(test)]
    pub(crate) async fn lock_table_len(&self) -> usize {
        self.locks.lock().await.len()
    }
}
