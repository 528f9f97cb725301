//! Session-scoped repository workspaces
//!
//! Each client session owns one directory under the workspace root. The
//! [`WorkspaceManager`] ties together path containment ([`PathSandbox`]),
//! the live-session registry ([`SessionStore`]), population by clone or
//! archive ([`WorkspacePopulator`]) and heartbeat-driven eviction
//! ([`LivenessMonitor`]).

pub mod archive;
pub mod error;
pub mod manager;
pub mod monitor;
pub mod populator;
pub mod sandbox;
pub mod store;


pub use error::{WorkspaceError, WorkspaceResult};
pub use manager::{Analysis, RenderedExport, WorkspaceManager};
pub use monitor::LivenessMonitor;
pub use populator::WorkspacePopulator;
pub use sandbox::{best_effort_delete, DeletionReport, PathSandbox};
pub use store::{Checkout, Session, SessionStore};

/// Run blocking filesystem work off the async runtime
pub(crate) async fn run_blocking<F, T>(work: F) -> WorkspaceResult<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| WorkspaceError::Internal(format!("blocking task failed: {e}")))
}
