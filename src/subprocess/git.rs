use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::builder::ProcessCommandBuilder;
use super::error::ProcessError;
use super::runner::{ProcessOutput, ProcessRunner};

#[async_trait]
pub trait GitRunner: Send + Sync {
    /// Depth-1 clone of `url` into `target`
    async fn clone_shallow(
        &self,
        url: &str,
        target: &Path,
        timeout: Duration,
    ) -> Result<ProcessOutput, ProcessError>;
}

pub struct GitRunnerImpl {
    runner: Arc<dyn ProcessRunner>,
}

impl GitRunnerImpl {
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl GitRunner for GitRunnerImpl {
    async fn clone_shallow(
        &self,
        url: &str,
        target: &Path,
        timeout: Duration,
    ) -> Result<ProcessOutput, ProcessError> {
        let target = target.to_str().ok_or_else(|| ProcessError::InternalError {
            message: format!("Clone target is not valid UTF-8: {}", target.display()),
        })?;

        let command = ProcessCommandBuilder::new("git")
            .args(["clone", "--depth", "1", "--", url, target])
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_CONFIG_NOSYSTEM", "1")
            .env("GIT_SSH_COMMAND", "ssh -o BatchMode=yes")
            .timeout(timeout)
            .build();

        self.runner.run(command).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subprocess::MockProcessRunner;

    #[tokio::test]
    async fn test_clone_shallow_arguments() {
        let mock = MockProcessRunner::new();
        mock.expect_command("git").returns_success().finish();

        let git = GitRunnerImpl::new(Arc::new(mock.clone()));
        let output = git
            .clone_shallow(
                "https://example.com/org/repo.git",
                Path::new("/tmp/ws/repo"),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert!(output.status.success());

        let history = mock.get_call_history();
        assert_eq!(history.len(), 1);
        assert_eq!(
            history[0].args,
            vec![
                "clone",
                "--depth",
                "1",
                "--",
                "https://example.com/org/repo.git",
                "/tmp/ws/repo"
            ]
        );
        assert_eq!(
            history[0].env.get("GIT_TERMINAL_PROMPT").map(String::as_str),
            Some("0")
        );
        assert_eq!(history[0].timeout, Some(Duration::from_secs(5)));
    }
}
