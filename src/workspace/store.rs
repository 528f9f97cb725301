//! In-memory registry of live sessions

use super::error::{WorkspaceError, WorkspaceResult};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

/// A populated repository inside a session workspace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkout {
    /// Repository name shown to the client
    pub name: String,
    /// Checkout root relative to the session workspace; empty for the workspace itself
    pub relative_root: PathBuf,
}

impl Checkout {
    pub fn directory(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            relative_root: PathBuf::from(&name),
            name,
        }
    }

    pub fn workspace_root(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            relative_root: PathBuf::new(),
        }
    }
}

/// Snapshot of a session record
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub repos: BTreeMap<String, PathBuf>,
    pub last_heartbeat: DateTime<Utc>,
}

impl Session {
    fn new(id: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            repos: BTreeMap::new(),
            last_heartbeat: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        match chrono::Duration::from_std(timeout) {
            Ok(timeout) => now.signed_duration_since(self.last_heartbeat) > timeout,
            Err(_) => false,
        }
    }
}

/// Process-wide mapping of session id to session record
#[derive(Debug, Clone, Default)]
pub struct SessionStore {
    sessions: Arc<RwLock<HashMap<String, Session>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the session if absent, otherwise refresh its heartbeat
    pub async fn touch(&self, session_id: &str) {
        self.touch_at(session_id, Utc::now()).await;
    }

    /// Same as [`touch`](Self::touch) with an explicit timestamp
    pub async fn touch_at(&self, session_id: &str, now: DateTime<Utc>) {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(session_id) {
            Some(session) => session.last_heartbeat = now,
            None => {
                debug!("Registering session {}", session_id);
                sessions.insert(session_id.to_string(), Session::new(session_id, now));
            }
        }
    }

    /// Add a repository to a session; silently ignored for unknown sessions
    pub async fn record_repo(&self, session_id: &str, checkout: &Checkout) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(session_id) {
            session
                .repos
                .insert(checkout.name.clone(), checkout.relative_root.clone());
        }
    }

    /// Forget every repository of a session and record a single new one
    pub async fn replace_repos(&self, session_id: &str, checkout: &Checkout) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(session_id) {
            session.repos.clear();
            session
                .repos
                .insert(checkout.name.clone(), checkout.relative_root.clone());
        }
    }

    /// Forget every repository of a session, keeping the session itself
    pub async fn forget_repos(&self, session_id: &str) {
        if let Some(session) = self.sessions.write().await.get_mut(session_id) {
            session.repos.clear();
        }
    }

    /// Look up where a repository lives inside a session workspace
    pub async fn checkout_root(&self, session_id: &str, repo_name: &str) -> WorkspaceResult<PathBuf> {
        let sessions = self.sessions.read().await;
        let session = sessions
            .get(session_id)
            .ok_or_else(|| WorkspaceError::SessionNotFound(session_id.to_string()))?;
        session
            .repos
            .get(repo_name)
            .cloned()
            .ok_or_else(|| WorkspaceError::RepoNotFound {
                session_id: session_id.to_string(),
                repo_name: repo_name.to_string(),
            })
    }

    /// Remove a session record, returning whether one existed
    pub async fn destroy(&self, session_id: &str) -> bool {
        self.sessions.write().await.remove(session_id).is_some()
    }

    /// Ids of all sessions whose last heartbeat is older than `timeout`
    pub async fn list_expired(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<String> {
        let sessions = self.sessions.read().await;
        let mut expired: Vec<String> = sessions
            .values()
            .filter(|session| session.is_expired(now, timeout))
            .map(|session| session.id.clone())
            .collect();
        expired.sort();
        expired
    }

    pub async fn get(&self, session_id: &str) -> Option<Session> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn contains(&self, session_id: &str) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Drop every session record
    pub async fn clear(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let count = sessions.len();
        sessions.clear();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(120);

    #[tokio::test]
    async fn test_touch_creates_then_refreshes() {
        let store = SessionStore::new();
        let start = Utc::now();

        store.touch_at("abc", start).await;
        assert!(store.contains("abc").await);
        assert_eq!(store.get("abc").await.unwrap().last_heartbeat, start);

        let later = start + chrono::Duration::seconds(10);
        store.touch_at("abc", later).await;
        assert_eq!(store.len().await, 1);
        assert_eq!(store.get("abc").await.unwrap().last_heartbeat, later);
    }

    #[tokio::test]
    async fn test_record_repo_ignores_unknown_session() {
        let store = SessionStore::new();
        store.record_repo("ghost", &Checkout::directory("repo")).await;
        assert!(!store.contains("ghost").await);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_record_repo_accumulates_and_replace_resets() {
        let store = SessionStore::new();
        store.touch("s").await;
        store.record_repo("s", &Checkout::directory("one")).await;
        store.record_repo("s", &Checkout::directory("two")).await;

        let session = store.get("s").await.unwrap();
        assert_eq!(session.repos.len(), 2);

        store
            .replace_repos("s", &Checkout::workspace_root("upload"))
            .await;
        let session = store.get("s").await.unwrap();
        assert_eq!(session.repos.len(), 1);
        assert_eq!(session.repos["upload"], PathBuf::new());
    }

    #[tokio::test]
    async fn test_checkout_root_errors() {
        let store = SessionStore::new();
        assert!(matches!(
            store.checkout_root("missing", "repo").await,
            Err(WorkspaceError::SessionNotFound(_))
        ));

        store.touch("s").await;
        assert!(matches!(
            store.checkout_root("s", "repo").await,
            Err(WorkspaceError::RepoNotFound { .. })
        ));

        store.record_repo("s", &Checkout::directory("repo")).await;
        assert_eq!(
            store.checkout_root("s", "repo").await.unwrap(),
            PathBuf::from("repo")
        );
    }

    #[tokio::test]
    async fn test_destroy_twice() {
        let store = SessionStore::new();
        store.touch("s").await;
        assert!(store.destroy("s").await);
        assert!(!store.destroy("s").await);
    }

    #[tokio::test]
    async fn test_list_expired_boundary() {
        let store = SessionStore::new();
        let now = Utc::now();
        store
            .touch_at("stale", now - chrono::Duration::seconds(121))
            .await;
        store
            .touch_at("fresh", now - chrono::Duration::seconds(119))
            .await;
        store
            .touch_at("exact", now - chrono::Duration::seconds(120))
            .await;

        let expired = store.list_expired(now, TIMEOUT).await;
        assert_eq!(expired, vec!["stale".to_string()]);

        // Pure query
        assert_eq!(store.len().await, 3);
    }

    #[tokio::test]
    async fn test_clear() {
        let store = SessionStore::new();
        store.touch("a").await;
        store.touch("b").await;
        assert_eq!(store.clear().await, 2);
        assert!(store.is_empty().await);
    }
}
