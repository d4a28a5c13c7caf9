//! Program catalog and global settings
//!
//! The catalog is an in-memory snapshot of the declarative program
//! description (a YAML file with `scripts`, `bots`, and `settings`).
//! Lookups hand out clones from the current snapshot, so a concurrent
//! reload never affects an in-flight execution.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::info;

/// Classification of a catalog entry. Informational only; both kinds run
/// through the same execution pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgramKind {
    Script,
    Bot,
}

/// A user-declared unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Program {
    /// Unique across the whole catalog, both collections included.
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Directory holding the program sources. Relative paths resolve
    /// against the process working directory; absolute paths are used
    /// verbatim (external program directories).
    pub path: PathBuf,
    /// Entry file inside `path`. Fallback resolution still applies when
    /// the declared file is absent.
    #[serde(default = "default_main_file")]
    pub main_file: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Container image override; the global default image applies when unset.
    #[serde(default)]
    pub image: Option<String>,
    /// Literal argv suffix appended to the main-file invocation.
    #[serde(default)]
    pub parameters: Option<String>,
    /// When present the program runs in compose mode and `image` /
    /// `main_file` are ignored.
    #[serde(default)]
    pub compose_path: Option<PathBuf>,
    #[serde(skip_deserializing, default = "default_kind")]
    pub kind: ProgramKind,
}

fn default_main_file() -> String {
    "main.py".to_string()
}

fn default_true() -> bool {
    true
}

fn default_kind() -> ProgramKind {
    ProgramKind::Script
}

impl Program {
    /// Whether this program runs through docker-compose.
    pub fn is_compose(&self) -> bool {
        self.compose_path.is_some()
    }

    /// Compose file path, with relative paths resolved against the
    /// program directory.
    pub fn resolved_compose_path(&self) -> Option<PathBuf> {
        self.compose_path.as_ref().map(|p| {
            if p.is_absolute() {
                p.clone()
            } else {
                self.path.join(p)
            }
        })
    }
}

/// Global execution settings from the catalog `settings` block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Image used when a program declares none.
    #[serde(rename = "docker_image", default = "default_image")]
    pub default_image: String,
    /// Per-execution deadline, measured from the `running` transition.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_executions: usize,
    /// Memory ceiling per container, e.g. "512m" or "1g".
    #[serde(default = "default_memory_limit")]
    pub memory_limit: String,
    /// CPU ceiling per container in fractional cores, e.g. "0.5".
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: String,
}

fn default_image() -> String {
    "python:3.11-slim".to_string()
}

fn default_timeout() -> u64 {
    300
}

fn default_max_concurrent() -> usize {
    5
}

fn default_memory_limit() -> String {
    "1g".to_string()
}

fn default_cpu_limit() -> String {
    "1.0".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_image: default_image(),
            timeout_seconds: default_timeout(),
            max_concurrent_executions: default_max_concurrent(),
            memory_limit: default_memory_limit(),
            cpu_limit: default_cpu_limit(),
        }
    }
}

impl Settings {
    /// Memory limit in bytes. Accepts a bare byte count or a `k`/`m`/`g`
    /// suffix, case-insensitive.
    pub fn memory_limit_bytes(&self) -> Result<i64, CatalogError> {
        parse_memory(&self.memory_limit)
            .ok_or_else(|| CatalogError::InvalidSetting {
                field: "memory_limit",
                value: self.memory_limit.clone(),
            })
    }

    /// CPU limit in Docker nano-CPU units.
    pub fn nano_cpus(&self) -> Result<i64, CatalogError> {
        let cores: f64 = self
            .cpu_limit
            .trim()
            .parse()
            .map_err(|_| CatalogError::InvalidSetting {
                field: "cpu_limit",
                value: self.cpu_limit.clone(),
            })?;
        if cores <= 0.0 {
            return Err(CatalogError::InvalidSetting {
                field: "cpu_limit",
                value: self.cpu_limit.clone(),
            });
        }
        Ok((cores * 1_000_000_000.0) as i64)
    }
}

fn parse_memory(limit: &str) -> Option<i64> {
    let limit = limit.trim().to_lowercase();
    let (digits, multiplier) = match limit.chars().last()? {
        'k' => (&limit[..limit.len() - 1], 1024i64),
        'm' => (&limit[..limit.len() - 1], 1024i64 * 1024),
        'g' => (&limit[..limit.len() - 1], 1024i64 * 1024 * 1024),
        _ => (limit.as_str(), 1),
    };
    let value: i64 = digits.trim().parse().ok()?;
    (value > 0).then_some(value * multiplier)
}

/// On-disk catalog file shape: two program collections plus settings.
#[derive(Debug, Default, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    settings: Option<Settings>,
    #[serde(default)]
    scripts: Vec<Program>,
    #[serde(default)]
    bots: Vec<Program>,
}

/// Immutable view of the catalog at one point in time.
#[derive(Debug)]
pub struct Snapshot {
    programs: HashMap<String, Program>,
    order: Vec<String>,
    settings: Settings,
}

impl Snapshot {
    fn from_yaml(text: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile = serde_yaml::from_str(text)?;

        let mut programs = HashMap::new();
        let mut order = Vec::new();
        let tagged = file
            .scripts
            .into_iter()
            .map(|p| (ProgramKind::Script, p))
            .chain(file.bots.into_iter().map(|p| (ProgramKind::Bot, p)));

        for (kind, mut program) in tagged {
            program.kind = kind;
            let id = program.id.clone();
            if programs.insert(id.clone(), program).is_some() {
                return Err(CatalogError::DuplicateId(id));
            }
            order.push(id);
        }

        Ok(Self {
            programs,
            order,
            settings: file.settings.unwrap_or_default(),
        })
    }

    pub fn lookup(&self, program_id: &str) -> Option<&Program> {
        self.programs.get(program_id)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// All programs in declaration order, scripts first.
    pub fn programs(&self) -> impl Iterator<Item = &Program> {
        self.order.iter().filter_map(|id| self.programs.get(id))
    }
}

/// Catalog errors surface at load/reload time; queries never fail.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("failed to read catalog file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse catalog file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("duplicate program id in catalog: {0}")]
    DuplicateId(String),

    #[error("invalid setting {field}: {value:?}")]
    InvalidSetting { field: &'static str, value: String },
}

/// Shared handle to the current catalog snapshot.
#[derive(Debug)]
pub struct Catalog {
    path: Option<PathBuf>,
    snapshot: RwLock<Arc<Snapshot>>,
}

impl Catalog {
    /// Load the catalog from a YAML file. The path is retained for
    /// subsequent [`Catalog::reload`] calls.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref().to_path_buf();
        let snapshot = Self::read_snapshot(&path)?;
        info!(
            catalog = %path.display(),
            programs = snapshot.programs.len(),
            "Catalog loaded"
        );
        Ok(Self {
            path: Some(path),
            snapshot: RwLock::new(Arc::new(snapshot)),
        })
    }

    /// Build a catalog directly from YAML text. No file is associated, so
    /// `reload` is a no-op.
    pub fn from_yaml(text: &str) -> Result<Self, CatalogError> {
        Ok(Self {
            path: None,
            snapshot: RwLock::new(Arc::new(Snapshot::from_yaml(text)?)),
        })
    }

    fn read_snapshot(path: &Path) -> Result<Snapshot, CatalogError> {
        let text = std::fs::read_to_string(path)?;
        Snapshot::from_yaml(&text)
    }

    /// Re-read the catalog file and swap the snapshot atomically.
    /// In-flight executions keep the snapshot they resolved against.
    pub fn reload(&self) -> Result<(), CatalogError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let snapshot = Arc::new(Self::read_snapshot(path)?);
        let programs = snapshot.programs.len();
        *self.snapshot.write().expect("catalog lock poisoned") = snapshot;
        info!(catalog = %path.display(), programs, "Catalog reloaded");
        Ok(())
    }

    /// The current snapshot. Callers hold it for the duration of one
    /// operation; later reloads do not affect it.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.read().expect("catalog lock poisoned").clone()
    }

    pub fn lookup(&self, program_id: &str) -> Option<Program> {
        self.snapshot().lookup(program_id).cloned()
    }

    pub fn settings(&self) -> Settings {
        self.snapshot().settings().clone()
    }

    pub fn programs(&self) -> Vec<Program> {
        self.snapshot().programs().cloned().collect()
    }
}
