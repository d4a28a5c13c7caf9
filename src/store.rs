//! Execution records and the process-local registry
//!
//! Records live as long as the process does. A record is mutated at
//! exactly two boundaries, entering `running` and entering a terminal
//! state; terminal states are absorbing and the store enforces it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Execution lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    /// Reserved and recorded, worker not yet started.
    Queued,
    Running,
    Completed,
    Failed,
    Timeout,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Timeout
        )
    }
}

/// One attempt to run a program.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub execution_id: String,
    pub program_id: String,
    pub status: ExecutionStatus,
    pub start_time: DateTime<Utc>,
    /// Set when the record reaches a terminal state.
    pub end_time: Option<DateTime<Utc>>,
    /// Captured standard output.
    #[serde(default)]
    pub output: String,
    /// Captured standard error, or a diagnostic on infrastructure failure.
    #[serde(default)]
    pub error: String,
    pub exit_code: Option<i64>,
}

impl Execution {
    /// A fresh record in the `queued` state.
    pub fn queued(execution_id: impl Into<String>, program_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            program_id: program_id.into(),
            status: ExecutionStatus::Queued,
            start_time: Utc::now(),
            end_time: None,
            output: String::new(),
            error: String::new(),
            exit_code: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("execution already exists: {0}")]
    Duplicate(String),

    #[error("execution not found: {0}")]
    NotFound(String),

    #[error("execution already terminal: {0}")]
    Terminal(String),
}

/// Concurrent registry of execution records keyed by execution id.
#[derive(Debug, Default)]
pub struct ExecutionStore {
    records: RwLock<HashMap<String, Execution>>,
}

impl ExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new record; duplicate ids are rejected.
    pub async fn create(&self, record: Execution) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.execution_id) {
            return Err(StoreError::Duplicate(record.execution_id.clone()));
        }
        records.insert(record.execution_id.clone(), record);
        Ok(())
    }

    /// Apply `mutator` atomically. Refused once the record is terminal;
    /// the mutator is never called in that case.
    pub async fn update(
        &self,
        execution_id: &str,
        mutator: impl FnOnce(&mut Execution),
    ) -> Result<Execution, StoreError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(execution_id)
            .ok_or_else(|| StoreError::NotFound(execution_id.to_string()))?;
        if record.is_terminal() {
            return Err(StoreError::Terminal(execution_id.to_string()));
        }
        mutator(record);
        Ok(record.clone())
    }

    pub async fn get(&self, execution_id: &str) -> Option<Execution> {
        self.records.read().await.get(execution_id).cloned()
    }

    /// Snapshot of all records, oldest submission first.
    pub async fn list(&self) -> Vec<Execution> {
        let mut records: Vec<_> = self.records.read().await.values().cloned().collect();
        records.sort_by_key(|r| r.start_time);
        records
    }

    /// Number of records that still hold an admission slot.
    pub async fn non_terminal_count(&self) -> usize {
        self.records
            .read()
            .await
            .values()
            .filter(|r| !r.is_terminal())
            .count()
    }

    /// Remove terminal records matching `predicate`; returns how many
    /// were removed. Non-terminal records are never pruned.
    pub async fn prune(&self, predicate: impl Fn(&Execution) -> bool) -> usize {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, r| !(r.is_terminal() && predicate(r)));
        before - records.len()
    }
}
