//! Common test utilities and helpers

#![allow(dead_code)]

use repo2md::server::{self, AppState};
use repo2md::subprocess::{MockProcessRunner, ProcessCommand, SubprocessManager};
use repo2md::workspace::{PathSandbox, SessionStore, WorkspaceManager, WorkspacePopulator};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(120);

/// Build a manager over `root` whose git is scripted through the returned mock
pub fn test_manager(root: &Path) -> (Arc<WorkspaceManager>, MockProcessRunner) {
    let sandbox = PathSandbox::new(root).expect("workspace root");
    let (subprocess, mock) = SubprocessManager::mock();
    let populator = WorkspacePopulator::new(
        sandbox.clone(),
        subprocess,
        Duration::from_secs(30),
        10 * 1024 * 1024,
    );
    let manager = WorkspaceManager::new(sandbox, SessionStore::new(), populator, HEARTBEAT_TIMEOUT);
    (Arc::new(manager), mock)
}

/// Make every `git clone` write `files` into its target directory
pub fn fake_clone(mock: &MockProcessRunner, files: &'static [(&'static str, &'static str)]) {
    mock.expect_command("git")
        .with_effect(move |command: &ProcessCommand| {
            let target = Path::new(command.args.last().expect("clone target"));
            for (path, contents) in files {
                let path = target.join(path);
                fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
                fs::write(path, contents).expect("write");
            }
        })
        .returns_success()
        .finish();
}

pub const SAMPLE_REPO: &[(&str, &str)] = &[
    ("src/main.rs", "fn main() {\n    println!(\"hi\");\n}\n"),
    ("src/lib.rs", "pub mod util;\n"),
    ("docs/guide.md", "# Guide\n"),
    ("Cargo.toml", "[package]\nname = \"sample\"\n"),
    (".gitignore", "target\n"),
];

/// A running server bound to an ephemeral port
pub struct TestServer {
    pub addr: SocketAddr,
    pub manager: Arc<WorkspaceManager>,
    pub mock: MockProcessRunner,
    shutdown: CancellationToken,
    handle: Option<JoinHandle<anyhow::Result<()>>>,
    _root: TempDir,
}

impl TestServer {
    pub async fn start() -> Self {
        let root = TempDir::new().expect("temp dir");
        let (manager, mock) = test_manager(root.path());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let state = AppState::new(
            Arc::clone(&manager),
            format!("http://{addr}"),
            10 * 1024 * 1024,
        );

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(server::serve(listener, state, shutdown.clone()));

        Self {
            addr,
            manager,
            mock,
            shutdown,
            handle: Some(handle),
            _root: root,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, session_id: &str) -> String {
        format!("ws://{}/ws/{}", self.addr, session_id)
    }

    pub async fn stop(mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.handle.take() {
            handle.await.expect("server task").expect("server result");
        }
    }
}

/// Poll `condition` until it holds or a few seconds pass
pub async fn eventually<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
