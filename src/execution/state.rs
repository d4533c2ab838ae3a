//! Execution Snapshots
//!
//! Saves everything a plan execution owns to
//! `{state_dir}/{plan_execution_id}.state` so records stay queryable after
//! the process exits, and loads it back into a store.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};

use super::node_execution::NodeExecution;
use super::outcome::SweepingOutput;
use super::plan_execution::{Interrupt, PlanExecution};
use super::store::{NodeExecutionQuery, NodeExecutionStore};
use crate::error::StoreError;
use crate::plan::Plan;

/// Persistent image of one plan execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    pub plan_execution: PlanExecution,
    pub plan: Plan,
    pub node_executions: Vec<NodeExecution>,
    #[serde(default)]
    pub interrupts: Vec<Interrupt>,
    #[serde(default)]
    pub outputs: Vec<SweepingOutput>,
    pub saved_at: DateTime<Utc>,
}

impl ExecutionSnapshot {
    /// Collects the current state of `plan_execution_id` from `store`.
    pub fn capture(
        store: &dyn NodeExecutionStore,
        plan_execution_id: &str,
    ) -> Result<Self, StoreError> {
        let plan_execution = store.plan_execution(plan_execution_id)?;
        let plan = store.plan(&plan_execution.plan_id)?;

        Ok(Self {
            node_executions: store.find(&NodeExecutionQuery::for_plan(plan_execution_id)),
            interrupts: store.interrupts(plan_execution_id),
            outputs: store.outputs(plan_execution_id),
            plan: (*plan).clone(),
            plan_execution,
            saved_at: Utc::now(),
        })
    }

    /// Writes the snapshot as pretty JSON, creating `state_dir` if needed.
    pub fn save(&self, state_dir: impl AsRef<Path>) -> Result<PathBuf, StoreError> {
        let state_dir = state_dir.as_ref();
        fs::create_dir_all(state_dir).map_err(|e| {
            StoreError::Snapshot(format!("cannot create {}: {}", state_dir.display(), e))
        })?;

        let path = Self::path_for(state_dir, &self.plan_execution.uuid);
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| StoreError::Snapshot(e.to_string()))?;
        fs::write(&path, json)
            .map_err(|e| StoreError::Snapshot(format!("cannot write {}: {}", path.display(), e)))?;

        info!("Saved execution state to {}", path.display());
        Ok(path)
    }

    /// Reads the snapshot of `plan_execution_id` from `state_dir`.
    pub fn load(
        state_dir: impl AsRef<Path>,
        plan_execution_id: &str,
    ) -> Result<Self, StoreError> {
        let path = Self::path_for(state_dir.as_ref(), plan_execution_id);
        let content = fs::read_to_string(&path)
            .map_err(|e| StoreError::Snapshot(format!("cannot read {}: {}", path.display(), e)))?;
        let snapshot: ExecutionSnapshot =
            serde_json::from_str(&content).map_err(|e| StoreError::Snapshot(e.to_string()))?;

        info!(
            "Loaded execution state from {} ({} node executions)",
            path.display(),
            snapshot.node_executions.len()
        );
        Ok(snapshot)
    }

    /// Inserts the snapshot's contents into `store`. Versions are kept as
    /// saved.
    pub fn restore_into(self, store: &dyn NodeExecutionStore) -> Result<(), StoreError> {
        store.save_plan(self.plan)?;
        store.create_plan_execution(self.plan_execution)?;
        for record in self.node_executions {
            store.insert(record)?;
        }
        for interrupt in self.interrupts {
            store.save_interrupt(interrupt)?;
        }
        for output in self.outputs {
            store.put_output(output)?;
        }
        Ok(())
    }

    /// Snapshot file for a plan execution.
    pub fn path_for(state_dir: &Path, plan_execution_id: &str) -> PathBuf {
        state_dir.join(format!("{}.state", plan_execution_id))
    }

    /// Deletes the snapshot file if it exists.
    pub fn delete(state_dir: impl AsRef<Path>, plan_execution_id: &str) -> Result<(), StoreError> {
        let path = Self::path_for(state_dir.as_ref(), plan_execution_id);
        if path.exists() {
            fs::remove_file(&path).map_err(|e| StoreError::Snapshot(e.to_string()))?;
            info!("Deleted state file: {}", path.display());
        }
        Ok(())
    }
}
