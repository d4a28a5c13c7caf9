//! Docker implementation of the container driver
//!
//! One-shot executions go through the Docker API (bollard): create with
//! resource limits and read-only mounts, attach before start so no early
//! output is lost, wait for exit, remove on every path. Compose mode
//! shells out to `docker compose`, which owns the topology lifecycle.

use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    KillContainerOptions, ListContainersOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, Mount, MountTypeEnum};
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::command::{ACTIONS_DIR, WORKSPACE_DIR};
use crate::driver::{
    ActiveContainer, ComposeSpec, ContainerDriver, ContainerLogs, DriverError, OneshotSpec,
    RunOutput,
};

/// Ceiling on a registry pull. A pull that takes longer than this is
/// reported as image-unavailable.
const PULL_TIMEOUT: Duration = Duration::from_secs(300);

/// Production driver backed by the local Docker daemon.
#[derive(Debug)]
pub struct DockerDriver {
    docker: Docker,
}

impl DockerDriver {
    /// Connect to the Docker daemon and verify it responds.
    pub async fn connect() -> Result<Self, DriverError> {
        let docker = Docker::connect_with_socket_defaults()
            .map_err(|e| DriverError::Unavailable(format!("failed to connect to Docker: {e}")))?;

        docker
            .ping()
            .await
            .map_err(|e| DriverError::Unavailable(format!("Docker daemon not accessible: {e}")))?;

        info!("Docker daemon connection established");
        Ok(Self { docker })
    }

    /// Wrap an existing client. Used by callers that configure the
    /// connection themselves.
    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }

    pub fn client(&self) -> &Docker {
        &self.docker
    }

    /// Best-effort removal; errors are deliberately dropped because every
    /// caller is already on a cleanup path.
    async fn force_remove(&self, handle: &str) {
        let _ = self
            .docker
            .remove_container(
                handle,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;
    }
}

/// Map a Docker API failure onto the driver taxonomy.
fn classify(err: bollard::errors::Error) -> DriverError {
    use bollard::errors::Error;
    match err {
        Error::DockerResponseServerError {
            status_code,
            message,
        } => {
            if status_code >= 500 {
                DriverError::Internal(message)
            } else {
                DriverError::Rejected(message)
            }
        }
        Error::IOError { .. } | Error::RequestTimeoutError => {
            DriverError::Unavailable(err.to_string())
        }
        other => DriverError::Internal(other.to_string()),
    }
}

fn compose_project_dir(spec: &ComposeSpec) -> &Path {
    spec.compose_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

#[async_trait]
impl ContainerDriver for DockerDriver {
    async fn ensure_image(&self, image: &str) -> Result<(), DriverError> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image, "Image present locally");
            return Ok(());
        }

        info!(image, "Image not found locally, pulling");
        let options = Some(CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        });

        let pull = async {
            let mut stream = self.docker.create_image(options, None, None);
            while let Some(result) = stream.next().await {
                match result {
                    Ok(progress) => {
                        if let Some(status) = progress.status {
                            debug!(image, "Image pull: {}", status);
                        }
                    }
                    Err(e) => {
                        return Err(DriverError::ImageUnavailable {
                            image: image.to_string(),
                            reason: e.to_string(),
                        });
                    }
                }
            }
            Ok(())
        };

        match timeout(PULL_TIMEOUT, pull).await {
            Ok(result) => {
                result?;
                info!(image, "Image pulled successfully");
                Ok(())
            }
            Err(_) => Err(DriverError::ImageUnavailable {
                image: image.to_string(),
                reason: format!("pull exceeded {} second ceiling", PULL_TIMEOUT.as_secs()),
            }),
        }
    }

    async fn image_present(&self, image: &str) -> Result<bool, DriverError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(classify(e)),
        }
    }

    async fn run_oneshot(&self, spec: &OneshotSpec) -> Result<RunOutput, DriverError> {
        let mut mounts = vec![Mount {
            target: Some(WORKSPACE_DIR.to_string()),
            source: Some(spec.program_dir.to_string_lossy().into_owned()),
            typ: Some(MountTypeEnum::BIND),
            read_only: Some(true),
            ..Default::default()
        }];
        if let Some(actions_dir) = &spec.actions_dir {
            mounts.push(Mount {
                target: Some(ACTIONS_DIR.to_string()),
                source: Some(actions_dir.to_string_lossy().into_owned()),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(true),
                ..Default::default()
            });
        }

        let host_config = HostConfig {
            memory: Some(spec.memory_limit_bytes),
            nano_cpus: Some(spec.nano_cpus),
            mounts: Some(mounts),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            working_dir: Some(WORKSPACE_DIR.to_string()),
            cmd: Some(spec.command.clone()),
            env: Some(spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect()),
            host_config: Some(host_config),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.handle.clone(),
            platform: None,
        };

        self.docker
            .create_container(Some(options), config)
            .await
            .map_err(classify)?;
        debug!(handle = %spec.handle, image = %spec.image, "Container created");

        // Attach before starting so the earliest output is captured.
        let attach_options = AttachContainerOptions::<String> {
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            logs: Some(true),
            ..Default::default()
        };
        let AttachContainerResults { mut output, .. } = match self
            .docker
            .attach_container(&spec.handle, Some(attach_options))
            .await
        {
            Ok(attached) => attached,
            Err(e) => {
                self.force_remove(&spec.handle).await;
                return Err(classify(e));
            }
        };

        if let Err(e) = self
            .docker
            .start_container(&spec.handle, None::<StartContainerOptions<String>>)
            .await
        {
            self.force_remove(&spec.handle).await;
            return Err(classify(e));
        }
        debug!(handle = %spec.handle, "Container started");

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        while let Some(Ok(chunk)) = output.next().await {
            match chunk {
                LogOutput::StdOut { message } => stdout.extend_from_slice(&message),
                LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
                _ => {}
            }
        }

        // The attach stream has closed, so the container is stopping; the
        // default wait condition returns as soon as it is not running.
        let mut waiter = self
            .docker
            .wait_container(&spec.handle, None::<WaitContainerOptions<String>>);
        let exit_code = match waiter.next().await {
            Some(Ok(exit)) => exit.status_code,
            // A non-zero program exit is reported as a wait error, not a
            // driver failure.
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => code,
            Some(Err(e)) => {
                self.force_remove(&spec.handle).await;
                return Err(classify(e));
            }
            None => {
                self.force_remove(&spec.handle).await;
                return Err(DriverError::Internal(
                    "container wait stream ended without an exit status".to_string(),
                ));
            }
        };

        self.force_remove(&spec.handle).await;
        debug!(
            handle = %spec.handle,
            exit_code,
            stdout_len = stdout.len(),
            stderr_len = stderr.len(),
            "Container finished"
        );

        Ok(RunOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    async fn kill_oneshot(&self, handle: &str) -> Result<(), DriverError> {
        use bollard::errors::Error;
        match self
            .docker
            .kill_container(handle, Some(KillContainerOptions { signal: "SIGKILL" }))
            .await
        {
            Ok(()) => info!(handle, "Container killed"),
            Err(Error::DockerResponseServerError {
                status_code: 404, ..
            }) => debug!(handle, "Container already gone"),
            Err(Error::DockerResponseServerError {
                status_code: 409,
                message,
            }) => debug!(handle, "Container not running: {}", message),
            Err(e) => return Err(classify(e)),
        }

        self.force_remove(handle).await;
        Ok(())
    }

    async fn run_compose(&self, spec: &ComposeSpec) -> Result<RunOutput, DriverError> {
        let compose_file = spec.compose_file.to_string_lossy().into_owned();
        info!(compose_file = %compose_file, "Starting compose execution");

        let up = Command::new("docker")
            .args([
                "compose",
                "-f",
                compose_file.as_str(),
                "up",
                "--abort-on-container-exit",
            ])
            .current_dir(compose_project_dir(spec))
            .envs(spec.env.clone())
            .kill_on_drop(true)
            .output()
            .await;

        // Services are released no matter how `up` went.
        if let Err(e) = self.compose_down(spec).await {
            warn!(compose_file = %compose_file, "compose down failed: {}", e);
        }

        let output = up.map_err(|e| {
            DriverError::Unavailable(format!("failed to run docker compose: {e}"))
        })?;

        Ok(RunOutput {
            exit_code: output.status.code().map(i64::from).unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn compose_down(&self, spec: &ComposeSpec) -> Result<(), DriverError> {
        let compose_file = spec.compose_file.to_string_lossy().into_owned();
        let output = Command::new("docker")
            .args(["compose", "-f", compose_file.as_str(), "down"])
            .current_dir(compose_project_dir(spec))
            .envs(spec.env.clone())
            .output()
            .await
            .map_err(|e| {
                DriverError::Unavailable(format!("failed to run docker compose down: {e}"))
            })?;

        if output.status.success() {
            info!(compose_file = %compose_file, "Compose topology down");
        } else {
            warn!(
                compose_file = %compose_file,
                "compose down exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<ActiveContainer>, DriverError> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await
            .map_err(classify)?;

        Ok(containers
            .into_iter()
            .map(|c| ActiveContainer {
                container_id: c.id.unwrap_or_default(),
                image: c.image.unwrap_or_default(),
                status: c.status.unwrap_or_default(),
                name: c
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|name| name.trim_start_matches('/').to_string())
                    .unwrap_or_default(),
            })
            .collect())
    }

    async fn logs_for_image(&self, image: &str) -> Result<Vec<ContainerLogs>, DriverError> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await
            .map_err(classify)?;

        let mut result = Vec::new();
        for container in containers {
            if container.image.as_deref() != Some(image) {
                continue;
            }
            let container_id = container.id.unwrap_or_default();

            let options = LogsOptions::<String> {
                stdout: true,
                stderr: true,
                ..Default::default()
            };
            let mut stream = self.docker.logs(&container_id, Some(options));
            let mut stdout = String::new();
            let mut stderr = String::new();
            while let Some(entry) = stream.next().await {
                match entry {
                    Ok(LogOutput::StdOut { message }) => {
                        stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(container_id = %container_id, "Error reading logs: {}", e);
                        break;
                    }
                }
            }

            result.push(ContainerLogs {
                container_id,
                stdout,
                stderr,
            });
        }

        Ok(result)
    }
}
