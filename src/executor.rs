//! Execution orchestration
//!
//! [`Executor::submit`] drives the synchronous half of an execution:
//! resolve the program, gate on the enabled flag, validate the
//! filesystem, provision the image, reserve an admission slot, record a
//! `queued` execution, and hand the rest to a spawned worker. The worker
//! owns the container for its lifetime and always releases the slot.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::admission::{AdmissionControl, AdmissionPermit};
use crate::catalog::{Catalog, Program, Settings};
use crate::command::CommandPlan;
use crate::driver::{container_handle, ComposeSpec, ContainerDriver, DriverError, OneshotSpec};
use crate::store::{Execution, ExecutionStatus, ExecutionStore};

/// Exit code recorded when the infrastructure, not the program, failed.
pub const INFRA_FAILURE_EXIT: i64 = -1;

/// Fallback entry files, probed in order when the declared main file is
/// absent.
pub const MAIN_FILE_FALLBACKS: [&str; 4] = ["main.py", "run.py", "app.py", "index.py"];

/// A request to run one program.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct ExecutionRequest {
    pub program_id: String,
    /// Free-form request parameters, surfaced to the container only as
    /// `PARAM_<UPPER(name)>` environment variables.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

impl ExecutionRequest {
    pub fn new(program_id: impl Into<String>) -> Self {
        Self {
            program_id: program_id.into(),
            parameters: HashMap::new(),
        }
    }
}

/// Synchronous submission rejections. Anything that happens after
/// admission is recorded on the execution instead.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("program not found: {0}")]
    NotFound(String),

    #[error("program is disabled: {0}")]
    Disabled(String),

    #[error("no runnable main file for program {0}")]
    MainFileMissing(String),

    #[error("image unavailable: {image}: {reason}")]
    ImageUnavailable { image: String, reason: String },

    #[error("concurrency limit reached: {current} of {limit} executions in flight")]
    Overloaded { current: usize, limit: usize },

    /// Not part of the submission taxonomy; indicates a bug or a broken
    /// catalog rather than a rejected request.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SubmitError {
    /// Stable kind tag for transport layers.
    pub fn kind(&self) -> &'static str {
        match self {
            SubmitError::NotFound(_) => "not_found",
            SubmitError::Disabled(_) => "disabled",
            SubmitError::MainFileMissing(_) => "main_file_missing",
            SubmitError::ImageUnavailable { .. } => "image_unavailable",
            SubmitError::Overloaded { .. } => "overloaded",
            SubmitError::Internal(_) => "internal",
        }
    }
}

/// Fully assembled launch description, built before the worker starts so
/// the worker never touches the catalog.
#[derive(Debug, Clone)]
enum Launch {
    Oneshot(OneshotSpec),
    Compose(ComposeSpec),
}

/// Orchestrates executions end-to-end.
pub struct Executor {
    catalog: Arc<Catalog>,
    store: Arc<ExecutionStore>,
    driver: Arc<dyn ContainerDriver>,
    admission: AdmissionControl,
    /// Host directory with `act_before`/`act_after` hooks, mounted at
    /// `/actions` when it exists.
    actions_dir: Option<PathBuf>,
}

impl Executor {
    pub fn new(
        catalog: Arc<Catalog>,
        store: Arc<ExecutionStore>,
        driver: Arc<dyn ContainerDriver>,
        admission: AdmissionControl,
        actions_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            catalog,
            store,
            driver,
            admission,
            actions_dir,
        }
    }

    /// Submit an execution. Returns the execution id as soon as the
    /// worker is dispatched; progress is observed through the store.
    pub async fn submit(&self, request: ExecutionRequest) -> Result<String, SubmitError> {
        // One snapshot for the whole resolution; reloads do not affect us.
        let snapshot = self.catalog.snapshot();
        let program = snapshot
            .lookup(&request.program_id)
            .ok_or_else(|| SubmitError::NotFound(request.program_id.clone()))?
            .clone();
        let settings = snapshot.settings().clone();

        if !program.enabled {
            return Err(SubmitError::Disabled(program.id.clone()));
        }

        let execution_id = Uuid::new_v4().to_string();
        let launch = self
            .build_launch(&program, &settings, &request, &execution_id)
            .await?;

        let permit = self
            .admission
            .reserve(settings.max_concurrent_executions)
            .map_err(|rejected| SubmitError::Overloaded {
                current: rejected.current,
                limit: rejected.limit,
            })?;

        if let Err(e) = self
            .store
            .create(Execution::queued(execution_id.as_str(), program.id.as_str()))
            .await
        {
            drop(permit);
            return Err(SubmitError::Internal(e.to_string()));
        }

        info!(
            execution_id = %execution_id,
            program_id = %program.id,
            "Execution admitted"
        );

        let worker = Worker {
            store: Arc::clone(&self.store),
            driver: Arc::clone(&self.driver),
            permit,
            execution_id: execution_id.clone(),
            launch,
            deadline: Duration::from_secs(settings.timeout_seconds),
        };
        tokio::spawn(worker.run());

        Ok(execution_id)
    }

    /// Validate the filesystem, provision the image, and assemble the
    /// launch description. Everything here happens before admission.
    async fn build_launch(
        &self,
        program: &Program,
        settings: &Settings,
        request: &ExecutionRequest,
        execution_id: &str,
    ) -> Result<Launch, SubmitError> {
        if program.is_compose() {
            let compose_file = program
                .resolved_compose_path()
                .ok_or_else(|| SubmitError::Internal("compose program without path".into()))?;
            if !compose_file.is_file() {
                return Err(SubmitError::MainFileMissing(format!(
                    "{}: compose file {} does not exist",
                    program.id,
                    compose_file.display()
                )));
            }

            let mut env = HashMap::new();
            env.insert("PROGRAM_ID".to_string(), program.id.clone());
            env.insert("EXECUTION_ID".to_string(), execution_id.to_string());
            return Ok(Launch::Compose(ComposeSpec { compose_file, env }));
        }

        let main_file = resolve_main_file(&program.path, &program.main_file)
            .ok_or_else(|| SubmitError::MainFileMissing(program.id.clone()))?;

        let image = program
            .image
            .clone()
            .unwrap_or_else(|| settings.default_image.clone());
        self.driver
            .ensure_image(&image)
            .await
            .map_err(|e| match e {
                DriverError::ImageUnavailable { image, reason } => {
                    SubmitError::ImageUnavailable { image, reason }
                }
                other => SubmitError::ImageUnavailable {
                    image: image.clone(),
                    reason: other.to_string(),
                },
            })?;

        let mut env = read_env_file(&program.path.join(".env"));
        for (name, value) in &request.parameters {
            env.insert(format!("PARAM_{}", name.to_uppercase()), value.clone());
        }
        env.insert("PROGRAM_ID".to_string(), program.id.clone());
        env.insert("EXECUTION_ID".to_string(), execution_id.to_string());

        let actions_dir = self
            .actions_dir
            .as_deref()
            .filter(|dir| dir.is_dir())
            .map(Path::to_path_buf);
        let mut plan = CommandPlan::new(main_file, program.parameters.clone());
        if let Some(dir) = &actions_dir {
            plan = plan.with_hooks(dir);
        }

        // Bind mounts need absolute host paths.
        let program_dir = program
            .path
            .canonicalize()
            .unwrap_or_else(|_| program.path.clone());

        let memory_limit_bytes = settings
            .memory_limit_bytes()
            .map_err(|e| SubmitError::Internal(e.to_string()))?;
        let nano_cpus = settings
            .nano_cpus()
            .map_err(|e| SubmitError::Internal(e.to_string()))?;

        Ok(Launch::Oneshot(OneshotSpec {
            handle: container_handle(execution_id),
            image,
            program_dir,
            actions_dir,
            env,
            command: plan.render(),
            memory_limit_bytes,
            nano_cpus,
        }))
    }
}

/// The asynchronous half of one execution. Owns the admission permit.
struct Worker {
    store: Arc<ExecutionStore>,
    driver: Arc<dyn ContainerDriver>,
    permit: AdmissionPermit,
    execution_id: String,
    launch: Launch,
    deadline: Duration,
}

impl Worker {
    async fn run(self) {
        let execution_id = self.execution_id.clone();
        if let Err(e) = self
            .store
            .update(&execution_id, |r| r.status = ExecutionStatus::Running)
            .await
        {
            // Record vanished before the worker started; nothing to drive.
            error!(execution_id = %execution_id, "Failed to mark execution running: {}", e);
            return;
        }
        info!(execution_id = %execution_id, "Execution running");

        // The deadline is measured from the `running` transition.
        let outcome = match &self.launch {
            Launch::Oneshot(spec) => timeout(self.deadline, self.driver.run_oneshot(spec)).await,
            Launch::Compose(spec) => timeout(self.deadline, self.driver.run_compose(spec)).await,
        };

        let result = match outcome {
            Ok(run) => run,
            Err(_elapsed) => {
                warn!(
                    execution_id = %execution_id,
                    timeout_seconds = self.deadline.as_secs(),
                    "Execution deadline expired, terminating container"
                );
                match &self.launch {
                    Launch::Oneshot(spec) => {
                        if let Err(e) = self.driver.kill_oneshot(&spec.handle).await {
                            warn!(execution_id = %execution_id, "Failed to kill container: {}", e);
                        }
                    }
                    Launch::Compose(spec) => {
                        if let Err(e) = self.driver.compose_down(spec).await {
                            warn!(execution_id = %execution_id, "Compose teardown failed: {}", e);
                        }
                    }
                }

                let deadline = self.deadline;
                let updated = self
                    .store
                    .update(&execution_id, |r| {
                        r.status = ExecutionStatus::Timeout;
                        r.error = format!(
                            "execution timed out after {} seconds",
                            deadline.as_secs()
                        );
                        r.end_time = Some(chrono::Utc::now());
                    })
                    .await;
                if let Err(e) = updated {
                    error!(execution_id = %execution_id, "Failed to record timeout: {}", e);
                }
                self.permit.release();
                return;
            }
        };

        let updated = match result {
            Ok(output) => {
                let status = if output.exit_code == 0 {
                    ExecutionStatus::Completed
                } else {
                    ExecutionStatus::Failed
                };
                info!(
                    execution_id = %execution_id,
                    exit_code = output.exit_code,
                    status = ?status,
                    "Execution finished"
                );
                self.store
                    .update(&execution_id, move |r| {
                        r.status = status;
                        r.exit_code = Some(output.exit_code);
                        r.output = output.stdout;
                        r.error = output.stderr;
                        r.end_time = Some(chrono::Utc::now());
                    })
                    .await
            }
            Err(driver_err) => {
                error!(execution_id = %execution_id, "Driver failure: {}", driver_err);
                self.store
                    .update(&execution_id, move |r| {
                        r.status = ExecutionStatus::Failed;
                        r.exit_code = Some(INFRA_FAILURE_EXIT);
                        r.error = format!("execution infrastructure failure: {driver_err}");
                        r.end_time = Some(chrono::Utc::now());
                    })
                    .await
            }
        };
        if let Err(e) = updated {
            error!(execution_id = %execution_id, "Failed to record outcome: {}", e);
        }

        self.permit.release();
    }
}

/// Resolve the entry file inside `program_dir`: the declared file when it
/// exists, otherwise the first fallback that does.
pub fn resolve_main_file(program_dir: &Path, declared: &str) -> Option<String> {
    if program_dir.join(declared).is_file() {
        return Some(declared.to_string());
    }
    MAIN_FILE_FALLBACKS
        .iter()
        .find(|candidate| program_dir.join(candidate).is_file())
        .map(|candidate| candidate.to_string())
}

/// Parse a per-program `.env` file: `KEY=VALUE` lines, `#` comments and
/// blank lines ignored, optional single or double quotes stripped from
/// values. A missing or unreadable file yields no variables.
fn read_env_file(path: &Path) -> HashMap<String, String> {
    let Ok(text) = std::fs::read_to_string(path) else {
        return HashMap::new();
    };

    let mut env = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
            .unwrap_or(value);
        env.insert(key.to_string(), value.to_string());
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{
        ActiveContainer, ContainerLogs, DriverError, MockContainerDriver, RunOutput,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    /// Build a program directory containing the named files.
    fn program_dir(files: &[&str]) -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        for file in files {
            std::fs::write(dir.path().join(file), "print('ok')").unwrap();
        }
        dir
    }

    fn catalog_for(dir: &TempDir, extra: &str) -> Arc<Catalog> {
        let yaml = format!(
            r#"
settings:
  docker_image: default:latest
  timeout_seconds: 60
  max_concurrent_executions: 5
scripts:
  - id: prog
    name: Prog
    path: {}
{extra}
"#,
            dir.path().display()
        );
        Arc::new(Catalog::from_yaml(&yaml).unwrap())
    }

    struct Harness {
        executor: Executor,
        store: Arc<ExecutionStore>,
        admission: AdmissionControl,
    }

    fn harness(catalog: Arc<Catalog>, driver: Arc<dyn ContainerDriver>) -> Harness {
        let store = Arc::new(ExecutionStore::new());
        let admission = AdmissionControl::new();
        let executor = Executor::new(
            catalog,
            Arc::clone(&store),
            driver,
            admission.clone(),
            None,
        );
        Harness {
            executor,
            store,
            admission,
        }
    }

    async fn wait_terminal(store: &ExecutionStore, execution_id: &str) -> Execution {
        loop {
            if let Some(record) = store.get(execution_id).await {
                if record.is_terminal() {
                    return record;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_reaches_completed() {
        let dir = program_dir(&["main.py"]);
        let mut driver = MockContainerDriver::new();
        driver.expect_ensure_image().returning(|_| Ok(()));
        driver.expect_run_oneshot().returning(|_| {
            Ok(RunOutput {
                exit_code: 0,
                stdout: "hello\n".into(),
                stderr: String::new(),
            })
        });

        let h = harness(catalog_for(&dir, ""), Arc::new(driver));
        let id = h
            .executor
            .submit(ExecutionRequest::new("prog"))
            .await
            .unwrap();

        let record = wait_terminal(&h.store, &id).await;
        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(record.exit_code, Some(0));
        assert_eq!(record.output, "hello\n");
        assert!(record.end_time.is_some());
        assert_eq!(h.admission.in_flight(), 0);
    }

    #[tokio::test]
    async fn unknown_program_is_rejected_without_record() {
        let dir = program_dir(&["main.py"]);
        let h = harness(catalog_for(&dir, ""), Arc::new(MockContainerDriver::new()));

        let err = h
            .executor
            .submit(ExecutionRequest::new("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::NotFound(_)));
        assert!(h.store.list().await.is_empty());
    }

    #[tokio::test]
    async fn disabled_program_is_rejected_without_record() {
        let dir = program_dir(&["main.py"]);
        let extra = format!(
            "  - id: dormant\n    name: Dormant\n    path: {}\n    enabled: false\n",
            dir.path().display()
        );
        let h = harness(catalog_for(&dir, &extra), Arc::new(MockContainerDriver::new()));

        let err = h
            .executor
            .submit(ExecutionRequest::new("dormant"))
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::Disabled(_)));
        assert!(h.store.list().await.is_empty());
        assert_eq!(h.admission.in_flight(), 0);
    }

    #[tokio::test]
    async fn empty_directory_is_main_file_missing() {
        let dir = program_dir(&[]);
        let h = harness(catalog_for(&dir, ""), Arc::new(MockContainerDriver::new()));

        let err = h
            .executor
            .submit(ExecutionRequest::new("prog"))
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::MainFileMissing(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn declared_main_absent_falls_back() {
        let dir = program_dir(&["run.py"]);
        let mut driver = MockContainerDriver::new();
        driver.expect_ensure_image().returning(|_| Ok(()));
        driver
            .expect_run_oneshot()
            .withf(|spec| spec.command[2].contains("python3 run.py"))
            .returning(|_| Ok(RunOutput::default()));

        let h = harness(catalog_for(&dir, ""), Arc::new(driver));
        let id = h
            .executor
            .submit(ExecutionRequest::new("prog"))
            .await
            .unwrap();
        let record = wait_terminal(&h.store, &id).await;
        assert_eq!(record.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn image_failure_rejects_before_admission() {
        let dir = program_dir(&["main.py"]);
        let mut driver = MockContainerDriver::new();
        driver.expect_ensure_image().returning(|image| {
            Err(DriverError::ImageUnavailable {
                image: image.to_string(),
                reason: "no such image".into(),
            })
        });

        let h = harness(catalog_for(&dir, ""), Arc::new(driver));
        let err = h
            .executor
            .submit(ExecutionRequest::new("prog"))
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::ImageUnavailable { .. }));
        assert!(h.store.list().await.is_empty());
        assert_eq!(h.admission.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn parameters_travel_on_separate_channels() {
        let dir = program_dir(&["main.py"]);
        std::fs::write(dir.path().join(".env"), "API_TOKEN=sekret\n# comment\n").unwrap();
        let yaml = format!(
            r#"
settings:
  docker_image: default:latest
scripts:
  - id: prog
    name: Prog
    path: {}
    parameters: "--flag"
"#,
            dir.path().display()
        );
        let catalog = Arc::new(Catalog::from_yaml(&yaml).unwrap());

        let mut driver = MockContainerDriver::new();
        driver.expect_ensure_image().returning(|_| Ok(()));
        driver
            .expect_run_oneshot()
            .withf(|spec| {
                let script = &spec.command[2];
                spec.env.get("PARAM_FOO").map(String::as_str) == Some("bar")
                    && spec.env.get("API_TOKEN").map(String::as_str) == Some("sekret")
                    && spec.env.get("PROGRAM_ID").map(String::as_str) == Some("prog")
                    && spec.env.contains_key("EXECUTION_ID")
                    && script.contains("python3 main.py --flag")
                    && !script.contains("bar")
            })
            .returning(|_| Ok(RunOutput::default()));

        let h = harness(catalog, Arc::new(driver));
        let mut request = ExecutionRequest::new("prog");
        request.parameters.insert("foo".into(), "bar".into());
        let id = h.executor.submit(request).await.unwrap();
        wait_terminal(&h.store, &id).await;
    }

    #[tokio::test(start_paused = true)]
    async fn program_failure_keeps_exit_code() {
        let dir = program_dir(&["main.py"]);
        let mut driver = MockContainerDriver::new();
        driver.expect_ensure_image().returning(|_| Ok(()));
        driver.expect_run_oneshot().returning(|_| {
            Ok(RunOutput {
                exit_code: 3,
                stdout: String::new(),
                stderr: "boom\n".into(),
            })
        });

        let h = harness(catalog_for(&dir, ""), Arc::new(driver));
        let id = h
            .executor
            .submit(ExecutionRequest::new("prog"))
            .await
            .unwrap();
        let record = wait_terminal(&h.store, &id).await;
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert_eq!(record.exit_code, Some(3));
        assert_eq!(record.error, "boom\n");
    }

    #[tokio::test(start_paused = true)]
    async fn driver_failure_records_sentinel() {
        let dir = program_dir(&["main.py"]);
        let mut driver = MockContainerDriver::new();
        driver.expect_ensure_image().returning(|_| Ok(()));
        driver
            .expect_run_oneshot()
            .returning(|_| Err(DriverError::Unavailable("socket closed".into())));

        let h = harness(catalog_for(&dir, ""), Arc::new(driver));
        let id = h
            .executor
            .submit(ExecutionRequest::new("prog"))
            .await
            .unwrap();
        let record = wait_terminal(&h.store, &id).await;
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert_eq!(record.exit_code, Some(INFRA_FAILURE_EXIT));
        assert!(record.error.contains("socket closed"));
        assert_eq!(h.admission.in_flight(), 0);
    }

    /// Driver whose launches never return, for deadline and overload
    /// schedules the expectation API cannot express.
    struct HangingDriver {
        killed: AtomicBool,
        downed: AtomicBool,
    }

    impl HangingDriver {
        fn new() -> Self {
            Self {
                killed: AtomicBool::new(false),
                downed: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl ContainerDriver for HangingDriver {
        async fn ensure_image(&self, _image: &str) -> Result<(), DriverError> {
            Ok(())
        }

        async fn image_present(&self, _image: &str) -> Result<bool, DriverError> {
            Ok(true)
        }

        async fn run_oneshot(&self, _spec: &OneshotSpec) -> Result<RunOutput, DriverError> {
            futures_util::future::pending().await
        }

        async fn kill_oneshot(&self, _handle: &str) -> Result<(), DriverError> {
            self.killed.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn run_compose(&self, _spec: &ComposeSpec) -> Result<RunOutput, DriverError> {
            futures_util::future::pending().await
        }

        async fn compose_down(&self, _spec: &ComposeSpec) -> Result<(), DriverError> {
            self.downed.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn list_active(&self) -> Result<Vec<ActiveContainer>, DriverError> {
            Ok(Vec::new())
        }

        async fn logs_for_image(&self, _image: &str) -> Result<Vec<ContainerLogs>, DriverError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_marks_timeout_and_kills_container() {
        let dir = program_dir(&["main.py"]);
        let yaml = format!(
            r#"
settings:
  docker_image: default:latest
  timeout_seconds: 2
scripts:
  - id: prog
    name: Prog
    path: {}
"#,
            dir.path().display()
        );
        let catalog = Arc::new(Catalog::from_yaml(&yaml).unwrap());
        let driver = Arc::new(HangingDriver::new());
        let h = harness(catalog, driver.clone());

        let id = h
            .executor
            .submit(ExecutionRequest::new("prog"))
            .await
            .unwrap();
        let record = wait_terminal(&h.store, &id).await;

        assert_eq!(record.status, ExecutionStatus::Timeout);
        assert!(record.error.contains("timed out after 2 seconds"));
        assert!(driver.killed.load(Ordering::SeqCst));
        assert_eq!(h.admission.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn overload_rejects_with_current_and_limit() {
        let dir = program_dir(&["main.py"]);
        let yaml = format!(
            r#"
settings:
  docker_image: default:latest
  timeout_seconds: 3600
  max_concurrent_executions: 2
scripts:
  - id: prog
    name: Prog
    path: {}
"#,
            dir.path().display()
        );
        let catalog = Arc::new(Catalog::from_yaml(&yaml).unwrap());
        let h = harness(catalog, Arc::new(HangingDriver::new()));

        h.executor
            .submit(ExecutionRequest::new("prog"))
            .await
            .unwrap();
        h.executor
            .submit(ExecutionRequest::new("prog"))
            .await
            .unwrap();

        let err = h
            .executor
            .submit(ExecutionRequest::new("prog"))
            .await
            .unwrap_err();
        match err {
            SubmitError::Overloaded { current, limit } => {
                assert_eq!(current, 2);
                assert_eq!(limit, 2);
            }
            other => panic!("expected overload, got {other:?}"),
        }
        assert_eq!(h.store.non_terminal_count().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn compose_mode_skips_image_and_runs_compose() {
        let dir = program_dir(&[]);
        std::fs::write(dir.path().join("docker-compose.yml"), "services: {}\n").unwrap();
        let yaml = format!(
            r#"
settings:
  docker_image: default:latest
bots:
  - id: stack
    name: Stack
    path: {}
    compose_path: docker-compose.yml
"#,
            dir.path().display()
        );
        let catalog = Arc::new(Catalog::from_yaml(&yaml).unwrap());

        let mut driver = MockContainerDriver::new();
        // No ensure_image expectation: a call would fail the test.
        driver
            .expect_run_compose()
            .withf(|spec| {
                spec.compose_file.ends_with("docker-compose.yml")
                    && spec.env.get("PROGRAM_ID").map(String::as_str) == Some("stack")
            })
            .returning(|_| {
                Ok(RunOutput {
                    exit_code: 0,
                    stdout: "up\n".into(),
                    stderr: String::new(),
                })
            });

        let h = harness(catalog, Arc::new(driver));
        let id = h
            .executor
            .submit(ExecutionRequest::new("stack"))
            .await
            .unwrap();
        let record = wait_terminal(&h.store, &id).await;
        assert_eq!(record.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn compose_file_missing_is_rejected() {
        let dir = program_dir(&[]);
        let yaml = format!(
            r#"
bots:
  - id: stack
    name: Stack
    path: {}
    compose_path: docker-compose.yml
"#,
            dir.path().display()
        );
        let catalog = Arc::new(Catalog::from_yaml(&yaml).unwrap());
        let h = harness(catalog, Arc::new(MockContainerDriver::new()));

        let err = h
            .executor
            .submit(ExecutionRequest::new("stack"))
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::MainFileMissing(_)));
    }

    #[test]
    fn env_file_parsing_handles_quotes_and_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(
            &path,
            "# secrets\nTOKEN=abc\nQUOTED=\"a b\"\nSINGLE='c d'\nBROKEN LINE\n\n=novalue\n",
        )
        .unwrap();

        let env = read_env_file(&path);
        assert_eq!(env.get("TOKEN").unwrap(), "abc");
        assert_eq!(env.get("QUOTED").unwrap(), "a b");
        assert_eq!(env.get("SINGLE").unwrap(), "c d");
        assert_eq!(env.len(), 3);

        assert!(read_env_file(&dir.path().join("absent")).is_empty());
    }

    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// The declared file wins when present; otherwise the first
        /// existing fallback; otherwise no resolution.
        #[test]
        fn main_file_resolution_law(
            declared_present in any::<bool>(),
            fallbacks in proptest::collection::vec(any::<bool>(), 4),
        ) {
            let dir = tempfile::tempdir().unwrap();
            let declared = "entry.py";
            if declared_present {
                std::fs::write(dir.path().join(declared), "").unwrap();
            }
            for (name, present) in MAIN_FILE_FALLBACKS.iter().zip(&fallbacks) {
                if *present {
                    std::fs::write(dir.path().join(name), "").unwrap();
                }
            }

            let resolved = resolve_main_file(dir.path(), declared);
            let expected = if declared_present {
                Some(declared.to_string())
            } else {
                MAIN_FILE_FALLBACKS
                    .iter()
                    .zip(&fallbacks)
                    .find(|(_, present)| **present)
                    .map(|(name, _)| name.to_string())
            };
            prop_assert_eq!(resolved, expected);
        }
    }
}
