//! ExecHub execution engine
//!
//! A single-host orchestrator core: programs declared in a YAML catalog
//! are executed in isolated Docker containers under a global concurrency
//! cap, with per-execution timeouts, captured output, and guaranteed
//! container cleanup. An HTTP layer (not part of this crate) wraps the
//! [`ExecutionHub`] facade.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use sysinfo::SystemExt;

pub mod admission;
pub mod catalog;
pub mod command;
pub mod docker;
pub mod driver;
pub mod executor;
pub mod report;
pub mod store;

pub use catalog::{Catalog, CatalogError, Program, ProgramKind, Settings};
pub use driver::{ActiveContainer, ContainerDriver, ContainerLogs, DriverError};
pub use executor::{ExecutionRequest, SubmitError};
pub use report::ImageUsage;
pub use store::{Execution, ExecutionStatus};

use admission::AdmissionControl;
use docker::DockerDriver;
use executor::Executor;
use report::{ContainerReporter, ImageReporter};
use store::ExecutionStore;

/// Engine configuration supplied by the host process.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Path to the YAML program catalog.
    pub catalog_path: PathBuf,
    /// Host directory with `act_before`/`act_after` hook scripts,
    /// mounted read-only at `/actions` inside execution containers.
    pub actions_dir: Option<PathBuf>,
}

/// The execution engine facade. Owns the catalog, the execution
/// registry, the admission counter, and the container driver; every
/// operation an HTTP collaborator needs is a method here.
pub struct ExecutionHub {
    catalog: Arc<Catalog>,
    store: Arc<ExecutionStore>,
    admission: AdmissionControl,
    driver: Arc<dyn ContainerDriver>,
    executor: Executor,
    image_reporter: ImageReporter,
    container_reporter: ContainerReporter,
}

impl ExecutionHub {
    /// Load the catalog and connect to the local Docker daemon.
    pub async fn new(config: HubConfig) -> Result<Self> {
        let catalog = Catalog::load(&config.catalog_path)
            .with_context(|| format!("failed to load catalog {}", config.catalog_path.display()))?;
        let driver = DockerDriver::connect()
            .await
            .context("failed to initialize container driver")?;
        Ok(Self::assemble(catalog, Arc::new(driver), config.actions_dir))
    }

    /// Assemble the engine around an existing driver. Tests use this to
    /// substitute a mock runtime.
    pub fn with_driver(
        catalog: Catalog,
        driver: Arc<dyn ContainerDriver>,
        actions_dir: Option<PathBuf>,
    ) -> Self {
        Self::assemble(catalog, driver, actions_dir)
    }

    fn assemble(
        catalog: Catalog,
        driver: Arc<dyn ContainerDriver>,
        actions_dir: Option<PathBuf>,
    ) -> Self {
        let catalog = Arc::new(catalog);
        let store = Arc::new(ExecutionStore::new());
        let admission = AdmissionControl::new();

        let executor = Executor::new(
            Arc::clone(&catalog),
            Arc::clone(&store),
            Arc::clone(&driver),
            admission.clone(),
            actions_dir,
        );
        let image_reporter = ImageReporter::new(Arc::clone(&catalog));
        let container_reporter = ContainerReporter::new(Arc::clone(&driver));

        Self {
            catalog,
            store,
            admission,
            driver,
            executor,
            image_reporter,
            container_reporter,
        }
    }

    /// Submit an execution request; returns the execution id immediately.
    pub async fn submit(&self, request: ExecutionRequest) -> Result<String, SubmitError> {
        self.executor.submit(request).await
    }

    pub async fn execution(&self, execution_id: &str) -> Option<Execution> {
        self.store.get(execution_id).await
    }

    pub async fn executions(&self) -> Vec<Execution> {
        self.store.list().await
    }

    /// Executions currently holding an admission slot.
    pub async fn running(&self) -> Vec<Execution> {
        self.store
            .list()
            .await
            .into_iter()
            .filter(|record| !record.is_terminal())
            .collect()
    }

    /// Drop all terminal execution records; returns how many were removed.
    pub async fn prune_finished(&self) -> usize {
        self.store.prune(|_| true).await
    }

    pub fn programs(&self) -> Vec<Program> {
        self.catalog.programs()
    }

    pub fn settings(&self) -> Settings {
        self.catalog.settings()
    }

    /// Re-read the catalog file. In-flight executions keep the snapshot
    /// they resolved against.
    pub fn reload_catalog(&self) -> Result<(), CatalogError> {
        self.catalog.reload()
    }

    /// Images declared in the catalog, derived without touching the
    /// runtime.
    pub fn images(&self) -> Vec<ImageUsage> {
        self.image_reporter.images()
    }

    pub async fn active_containers(&self) -> Result<Vec<ActiveContainer>, DriverError> {
        self.container_reporter.active().await
    }

    pub async fn container_logs(&self, image: &str) -> Result<Vec<ContainerLogs>, DriverError> {
        self.container_reporter.logs(image).await
    }

    /// Engine health: runtime reachability, execution counts, and host
    /// resources.
    pub async fn health_check(&self) -> HashMap<String, serde_json::Value> {
        let mut status = HashMap::new();
        status.insert(
            "version".to_string(),
            serde_json::Value::String(env!("CARGO_PKG_VERSION").to_string()),
        );

        match self.driver.list_active().await {
            Ok(containers) => {
                status.insert(
                    "docker_daemon".to_string(),
                    serde_json::Value::String("healthy".to_string()),
                );
                status.insert(
                    "containers_running".to_string(),
                    serde_json::Value::Number(containers.len().into()),
                );
            }
            Err(e) => {
                status.insert(
                    "docker_daemon".to_string(),
                    serde_json::Value::String(format!("unhealthy: {e}")),
                );
            }
        }

        let default_image = self.catalog.settings().default_image;
        let image_status = match self.driver.image_present(&default_image).await {
            Ok(true) => "available".to_string(),
            Ok(false) => "missing".to_string(),
            Err(e) => format!("unknown: {e}"),
        };
        status.insert(
            "default_image".to_string(),
            serde_json::Value::String(image_status),
        );

        status.insert(
            "executions_total".to_string(),
            serde_json::Value::Number(self.store.list().await.len().into()),
        );
        status.insert(
            "executions_in_flight".to_string(),
            serde_json::Value::Number(self.admission.in_flight().into()),
        );

        let system = sysinfo::System::new_all();
        status.insert(
            "system_memory_usage".to_string(),
            serde_json::Value::Number(system.used_memory().into()),
        );
        status.insert(
            "system_cpu_count".to_string(),
            serde_json::Value::Number(system.cpus().len().into()),
        );

        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{MockContainerDriver, RunOutput};
    use std::time::Duration;

    fn sample_catalog(dir: &tempfile::TempDir) -> Catalog {
        let yaml = format!(
            r#"
settings:
  docker_image: base:latest
scripts:
  - id: prog
    name: Prog
    path: {}
"#,
            dir.path().display()
        );
        Catalog::from_yaml(&yaml).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn facade_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.py"), "print('hi')").unwrap();

        let mut driver = MockContainerDriver::new();
        driver.expect_ensure_image().returning(|_| Ok(()));
        driver.expect_run_oneshot().returning(|_| {
            Ok(RunOutput {
                exit_code: 0,
                stdout: "hi\n".into(),
                stderr: String::new(),
            })
        });

        let hub = ExecutionHub::with_driver(sample_catalog(&dir), Arc::new(driver), None);
        assert_eq!(hub.programs().len(), 1);

        let id = hub.submit(ExecutionRequest::new("prog")).await.unwrap();
        loop {
            if let Some(record) = hub.execution(&id).await {
                if record.is_terminal() {
                    assert_eq!(record.status, ExecutionStatus::Completed);
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(hub.running().await.is_empty());
        assert_eq!(hub.executions().await.len(), 1);
        assert_eq!(hub.prune_finished().await, 1);
        assert!(hub.executions().await.is_empty());
    }

    #[tokio::test]
    async fn health_reports_daemon_and_default_image() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = MockContainerDriver::new();
        driver.expect_list_active().returning(|| Ok(Vec::new()));
        driver
            .expect_image_present()
            .withf(|image| image == "base:latest")
            .returning(|_| Ok(false));

        let hub = ExecutionHub::with_driver(sample_catalog(&dir), Arc::new(driver), None);
        let status = hub.health_check().await;

        assert_eq!(status["docker_daemon"], "healthy");
        assert_eq!(status["default_image"], "missing");
        assert_eq!(status["executions_in_flight"], 0);
    }
}
