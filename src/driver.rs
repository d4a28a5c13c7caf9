//! Container driver interface
//!
//! A narrow, testable seam in front of the container runtime. The executor
//! only ever talks to [`ContainerDriver`]; the production implementation
//! lives in [`crate::docker`], and tests substitute a mock.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;

/// Driver failures, classified so callers can tell an absent image from a
/// dead daemon from a rejected request.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("image unavailable: {image}: {reason}")]
    ImageUnavailable { image: String, reason: String },

    #[error("container runtime unavailable: {0}")]
    Unavailable(String),

    #[error("container runtime rejected the request: {0}")]
    Rejected(String),

    #[error("container runtime internal error: {0}")]
    Internal(String),
}

/// Launch description for a one-shot execution container.
#[derive(Debug, Clone)]
pub struct OneshotSpec {
    /// Unique container name derived from the execution id.
    pub handle: String,
    pub image: String,
    /// Host directory bind-mounted read-only at `/workspace`.
    pub program_dir: PathBuf,
    /// Host hooks directory bind-mounted read-only at `/actions`.
    pub actions_dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
    /// Full container command, already assembled.
    pub command: Vec<String>,
    pub memory_limit_bytes: i64,
    pub nano_cpus: i64,
}

/// Launch description for a compose-mode execution.
#[derive(Debug, Clone)]
pub struct ComposeSpec {
    pub compose_file: PathBuf,
    pub env: HashMap<String, String>,
}

/// What came back from a finished container or compose run.
#[derive(Debug, Clone, Default)]
pub struct RunOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

/// One row of the active-container listing.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveContainer {
    pub container_id: String,
    pub image: String,
    pub status: String,
    pub name: String,
}

/// Captured log streams of one active container.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerLogs {
    pub container_id: String,
    pub stdout: String,
    pub stderr: String,
}

/// Thin wrapper over the container runtime. All operations tolerate
/// parallel calls; the runtime socket is shared.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    /// Succeed if the image is locally present, otherwise pull it.
    /// "Image missing" is always a structured error, never a panic.
    async fn ensure_image(&self, image: &str) -> Result<(), DriverError>;

    /// Whether the image is locally present. Never pulls.
    async fn image_present(&self, image: &str) -> Result<bool, DriverError>;

    /// Launch the container and block until it exits, capturing both
    /// streams separately.
    async fn run_oneshot(&self, spec: &OneshotSpec) -> Result<RunOutput, DriverError>;

    /// Forcibly terminate and remove a one-shot container. Tolerates the
    /// container being already gone.
    async fn kill_oneshot(&self, handle: &str) -> Result<(), DriverError>;

    /// Bring the compose topology up and block until it exits; `down` is
    /// issued unconditionally before this returns.
    async fn run_compose(&self, spec: &ComposeSpec) -> Result<RunOutput, DriverError>;

    /// Tear the compose topology down. Used on the deadline path, where
    /// the `run_compose` future was already abandoned.
    async fn compose_down(&self, spec: &ComposeSpec) -> Result<(), DriverError>;

    /// Currently running containers.
    async fn list_active(&self) -> Result<Vec<ActiveContainer>, DriverError>;

    /// Logs of running containers whose image matches `image` exactly.
    async fn logs_for_image(&self, image: &str) -> Result<Vec<ContainerLogs>, DriverError>;
}

/// Container name for an execution. Stable so the deadline path can kill
/// the container without holding the launch future.
pub fn container_handle(execution_id: &str) -> String {
    format!("exechub-exec-{execution_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_embeds_execution_id() {
        let handle = container_handle("01234567-abcd");
        assert_eq!(handle, "exechub-exec-01234567-abcd");
    }
}
