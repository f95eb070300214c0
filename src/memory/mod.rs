pub mod backend_cozo;

pub use backend_cozo::CozoStateStore;

use crate::core::agent::ExecutionResult;
use crate::core::decision::{Decision, Priority};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// One audit row per completed cycle. Written once, never updated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleRecord {
    pub cycle: u64,
    pub at: DateTime<Utc>,
    pub observation_summary: String,
    pub decision: Decision,
    /// `None` when nothing was executed this cycle.
    pub execution: Option<ExecutionResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Goal {
    pub id: String,
    pub description: String,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Goal {
    pub fn is_open(&self) -> bool {
        self.completed_at.is_none()
    }
}

/// Durable cycle log plus the goal table.
///
/// Each `append` is atomic: after a crash, readers see either the whole
/// record or nothing.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn append(&self, record: &CycleRecord) -> Result<()>;
    /// Up to `n` records, most recent first.
    async fn recent(&self, n: usize) -> Result<Vec<CycleRecord>>;
    async fn last_cycle(&self) -> Result<Option<u64>>;
    /// Every goal, open and completed, oldest first.
    async fn goals(&self) -> Result<Vec<Goal>>;
    async fn open_goals(&self) -> Result<Vec<Goal>> {
        Ok(self.goals().await?.into_iter().filter(Goal::is_open).collect())
    }
    async fn add_goal(&self, description: &str, priority: Priority) -> Result<Goal>;
    /// Returns `false` if no open goal has this id.
    async fn complete_goal(&self, id: &str) -> Result<bool>;
    async fn flush(&self) -> Result<()>;
}
