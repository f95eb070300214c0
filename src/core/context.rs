//! Per-cycle reasoning context, rebuilt from the state store every cycle.

use crate::core::decision::{Disposition, Priority};
use crate::memory::{CycleRecord, Goal, StateStore};
use anyhow::Result;
use serde::Serialize;

const ERROR_EXCERPT_CHARS: usize = 200;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReasoningContext {
    pub goals: Vec<GoalDigest>,
    /// Most recent first, never longer than the configured window.
    pub recent: Vec<OutcomeDigest>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GoalDigest {
    pub id: String,
    pub description: String,
    pub priority: Priority,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutcomeDigest {
    pub cycle: u64,
    pub observed: String,
    pub decision: Disposition,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionDigest>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionDigest {
    pub success: bool,
    pub outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ReasoningContext {
    pub async fn load(store: &dyn StateStore, window: usize) -> Result<Self> {
        let goals = store.open_goals().await?;
        let recent = store.recent(window).await?;
        Ok(Self::from_parts(&goals, &recent, window))
    }

    pub fn from_parts(goals: &[Goal], recent: &[CycleRecord], window: usize) -> Self {
        Self {
            goals: goals
                .iter()
                .filter(|g| g.is_open())
                .map(|g| GoalDigest {
                    id: g.id.clone(),
                    description: g.description.clone(),
                    priority: g.priority,
                })
                .collect(),
            recent: recent.iter().take(window).map(digest).collect(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }
}

fn digest(record: &CycleRecord) -> OutcomeDigest {
    OutcomeDigest {
        cycle: record.cycle,
        // first line only: "N change(s) observed:"
        observed: record
            .observation_summary
            .lines()
            .next()
            .unwrap_or_default()
            .to_string(),
        decision: record.decision.disposition,
        confidence: record.decision.confidence,
        action: record
            .decision
            .action
            .as_ref()
            .map(|a| format!("{}: {}", a.kind, a.description)),
        execution: record.execution.as_ref().map(|e| ExecutionDigest {
            success: e.success,
            outcome: e.outcome.to_string(),
            error: e
                .error
                .as_ref()
                .map(|err| err.chars().take(ERROR_EXCERPT_CHARS).collect()),
        }),
    }
}
