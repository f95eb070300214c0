use super::{CycleRecord, Goal, StateStore};
use crate::core::agent::{ExecutionOutcome, ExecutionResult};
use crate::core::decision::{Action, ActionKind, Decision, Disposition, Priority};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cozo::{DataValue, DbInstance, NamedRows, ScriptMutability};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const DB_FILE: &str = "oida.db";

const CYCLE_COLUMNS: &str = "seq, ts, summary, reasoning, disposition, confidence, \
    action_kind, action_description, action_prompt, action_priority, \
    exec_outcome, exec_success, exec_output, exec_truncated, exec_error, \
    exec_duration_us, exec_exit_code";

const CYCLE_VALUES: &str = "ts, summary, reasoning, disposition, confidence, \
    action_kind, action_description, action_prompt, action_priority, \
    exec_outcome, exec_success, exec_output, exec_truncated, exec_error, \
    exec_duration_us, exec_exit_code";

const GOAL_COLUMNS: &str = "id, description, priority, created_at, completed_at";

pub struct CozoStateStore {
    db: DbInstance,
}

impl CozoStateStore {
    /// Opens (or creates) the RocksDB-backed store under `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create state dir {}", dir.display()))?;
        let db_path = dir.join(DB_FILE);
        let db_path_str = db_path.to_str().context("Invalid UTF-8 in database path")?;

        let mut retries = 0;
        let max_retries = 5;
        let db = loop {
            match DbInstance::new("rocksdb", db_path_str, "{}") {
                Ok(db) => break db,
                Err(e)
                    if retries < max_retries
                        && e.to_string().contains("Resource temporarily unavailable") =>
                {
                    retries += 1;
                    warn!(retries, max_retries, "state store is locked, retrying");
                    std::thread::sleep(Duration::from_millis(500));
                }
                Err(e) => return Err(anyhow!("Failed to open CozoDB at {}: {}", db_path_str, e)),
            }
        };

        let store = Self { db };
        store.initialize_schema()?;
        info!(path = %db_path.display(), "state store opened");
        Ok(store)
    }

    /// Non-durable store, for tests and dry runs.
    pub fn in_memory() -> Result<Self> {
        let db = DbInstance::new("mem", "", "{}")
            .map_err(|e| anyhow!("Failed to open in-memory CozoDB: {}", e))?;
        let store = Self { db };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> Result<()> {
        let create_cycles = "
            :create cycles {
                seq: Int
                =>
                ts: Int,
                summary: String,
                reasoning: String,
                disposition: String,
                confidence: Float,
                action_kind: String?,
                action_description: String?,
                action_prompt: String?,
                action_priority: String?,
                exec_outcome: String?,
                exec_success: Bool?,
                exec_output: String?,
                exec_truncated: Bool?,
                exec_error: String?,
                exec_duration_us: Int?,
                exec_exit_code: Int?
            }
        ";
        self.run_schema_script(create_cycles, "cycles")?;

        let create_goals = "
            :create goals {
                id: String
                =>
                description: String,
                priority: String,
                created_at: Int,
                completed_at: Int?
            }
        ";
        self.run_schema_script(create_goals, "goals")
    }

    fn run_schema_script(&self, script: &str, name: &str) -> Result<()> {
        if let Err(e) = self.db.run_script(script, Default::default(), ScriptMutability::Mutable) {
            let msg = e.to_string();
            if msg.contains("conflicts with an existing one") || msg.contains("already exists") {
                debug!(relation = name, "relation already present");
            } else {
                bail!("Failed to create relation {}: {}", name, msg);
            }
        }
        Ok(())
    }

    fn run(
        &self,
        script: &str,
        params: BTreeMap<String, DataValue>,
        mutability: ScriptMutability,
    ) -> Result<NamedRows> {
        self.db
            .run_script(script, params, mutability)
            .map_err(|e| anyhow!("CozoDB Error: {}", e))
    }

    fn cycle_params(record: &CycleRecord) -> BTreeMap<String, DataValue> {
        let decision = &record.decision;
        let action = decision.action.as_ref();
        let exec = record.execution.as_ref();

        let mut params = BTreeMap::new();
        params.insert("seq".to_string(), DataValue::from(record.cycle as i64));
        params.insert("ts".to_string(), DataValue::from(record.at.timestamp_micros()));
        params.insert(
            "summary".to_string(),
            DataValue::from(record.observation_summary.clone()),
        );
        params.insert("reasoning".to_string(), DataValue::from(decision.reasoning.clone()));
        params.insert(
            "disposition".to_string(),
            DataValue::from(decision.disposition.as_str()),
        );
        params.insert("confidence".to_string(), DataValue::from(decision.confidence));
        params.insert(
            "action_kind".to_string(),
            opt_str(action.map(|a| a.kind.as_str())),
        );
        params.insert(
            "action_description".to_string(),
            opt_str(action.map(|a| a.description.as_str())),
        );
        params.insert(
            "action_prompt".to_string(),
            opt_str(action.map(|a| a.prompt.as_str())),
        );
        params.insert(
            "action_priority".to_string(),
            opt_str(action.map(|a| a.priority.as_str())),
        );
        params.insert(
            "exec_outcome".to_string(),
            opt_str(exec.map(|e| e.outcome.as_str())),
        );
        params.insert(
            "exec_success".to_string(),
            exec.map_or(DataValue::Null, |e| DataValue::Bool(e.success)),
        );
        params.insert(
            "exec_output".to_string(),
            opt_str(exec.map(|e| e.output.as_str())),
        );
        params.insert(
            "exec_truncated".to_string(),
            exec.map_or(DataValue::Null, |e| DataValue::Bool(e.output_truncated)),
        );
        params.insert(
            "exec_error".to_string(),
            opt_str(exec.and_then(|e| e.error.as_deref())),
        );
        params.insert(
            "exec_duration_us".to_string(),
            exec.map_or(DataValue::Null, |e| {
                DataValue::from(e.duration.as_micros().min(i64::MAX as u128) as i64)
            }),
        );
        params.insert(
            "exec_exit_code".to_string(),
            exec.and_then(|e| e.exit_code)
                .map_or(DataValue::Null, |c| DataValue::from(c as i64)),
        );
        params
    }

    fn query_cycles(&self, limit: usize) -> Result<Vec<CycleRecord>> {
        let script = format!(
            "?[{cols}] := *cycles{{{cols}}}\n:order -seq\n:limit {limit}",
            cols = CYCLE_COLUMNS,
            limit = limit
        );
        let result = self.run(&script, Default::default(), ScriptMutability::Immutable)?;
        result.rows.iter().map(|row| decode_cycle(row)).collect()
    }
}

#[async_trait]
impl StateStore for CozoStateStore {
    async fn append(&self, record: &CycleRecord) -> Result<()> {
        let params_list = CYCLE_COLUMNS
            .split(',')
            .map(|c| format!("${}", c.trim()))
            .collect::<Vec<_>>()
            .join(", ");
        let script = format!(
            "?[{cols}] <- [[{params}]]\n:insert cycles {{seq => {vals}}}",
            cols = CYCLE_COLUMNS,
            params = params_list,
            vals = CYCLE_VALUES
        );
        self.run(&script, Self::cycle_params(record), ScriptMutability::Mutable)
            .with_context(|| format!("Failed to append cycle {}", record.cycle))?;
        debug!(cycle = record.cycle, "cycle record committed");
        Ok(())
    }

    async fn recent(&self, n: usize) -> Result<Vec<CycleRecord>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        self.query_cycles(n)
    }

    async fn last_cycle(&self) -> Result<Option<u64>> {
        let result = self.run(
            "?[seq] := *cycles{seq}\n:order -seq\n:limit 1",
            Default::default(),
            ScriptMutability::Immutable,
        )?;
        Ok(result
            .rows
            .first()
            .and_then(|row| row.first())
            .and_then(DataValue::get_int)
            .map(|seq| seq as u64))
    }

    async fn goals(&self) -> Result<Vec<Goal>> {
        let script = format!(
            "?[{cols}] := *goals{{{cols}}}\n:order created_at, id",
            cols = GOAL_COLUMNS
        );
        let result = self.run(&script, Default::default(), ScriptMutability::Immutable)?;
        result.rows.iter().map(|row| decode_goal(row)).collect()
    }

    async fn add_goal(&self, description: &str, priority: Priority) -> Result<Goal> {
        let goal = Goal {
            id: Uuid::new_v4().simple().to_string()[..8].to_string(),
            description: description.to_string(),
            priority,
            created_at: Utc::now(),
            completed_at: None,
        };

        let mut params = BTreeMap::new();
        params.insert("id".to_string(), DataValue::from(goal.id.clone()));
        params.insert("description".to_string(), DataValue::from(goal.description.clone()));
        params.insert("priority".to_string(), DataValue::from(priority.as_str()));
        params.insert(
            "created_at".to_string(),
            DataValue::from(goal.created_at.timestamp_micros()),
        );
        let script = "
            ?[id, description, priority, created_at, completed_at] <-
                [[$id, $description, $priority, $created_at, null]]
            :insert goals {id => description, priority, created_at, completed_at}
        ";
        self.run(script, params, ScriptMutability::Mutable)
            .context("Failed to add goal")?;
        info!(id = %goal.id, priority = %priority, "goal added");
        Ok(goal)
    }

    async fn complete_goal(&self, id: &str) -> Result<bool> {
        let mut params = BTreeMap::new();
        params.insert("id".to_string(), DataValue::from(id));
        let open = self.run(
            "?[id] := *goals{id, completed_at}, id = $id, is_null(completed_at)",
            params.clone(),
            ScriptMutability::Immutable,
        )?;
        if open.rows.is_empty() {
            return Ok(false);
        }

        params.insert("ts".to_string(), DataValue::from(Utc::now().timestamp_micros()));
        let script = "
            ?[id, description, priority, created_at, completed_at] :=
                *goals{id, description, priority, created_at},
                id = $id,
                completed_at = $ts
            :put goals {id => description, priority, created_at, completed_at}
        ";
        self.run(script, params, ScriptMutability::Mutable)
            .with_context(|| format!("Failed to complete goal {}", id))?;
        info!(id, "goal completed");
        Ok(true)
    }

    async fn flush(&self) -> Result<()> {
        // The in-memory engine has nothing to compact.
        if let Err(e) = self.run("::compact", Default::default(), ScriptMutability::Mutable) {
            debug!(error = %e, "compact skipped");
        }
        Ok(())
    }
}

fn opt_str(value: Option<&str>) -> DataValue {
    value.map_or(DataValue::Null, DataValue::from)
}

fn column<'a>(row: &'a [DataValue], idx: usize) -> Result<&'a DataValue> {
    row.get(idx)
        .ok_or_else(|| anyhow!("row has no column {}", idx))
}

fn req_str(row: &[DataValue], idx: usize) -> Result<String> {
    column(row, idx)?
        .get_str()
        .map(str::to_string)
        .ok_or_else(|| anyhow!("column {} is not a string", idx))
}

fn opt_string(row: &[DataValue], idx: usize) -> Result<Option<String>> {
    Ok(column(row, idx)?.get_str().map(str::to_string))
}

fn req_int(row: &[DataValue], idx: usize) -> Result<i64> {
    column(row, idx)?
        .get_int()
        .ok_or_else(|| anyhow!("column {} is not an integer", idx))
}

fn timestamp(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros).ok_or_else(|| anyhow!("bad timestamp {}", micros))
}

fn decode_cycle(row: &[DataValue]) -> Result<CycleRecord> {
    let disposition: Disposition = req_str(row, 4)?.parse().map_err(|e: String| anyhow!(e))?;
    let confidence = column(row, 5)?
        .get_float()
        .ok_or_else(|| anyhow!("confidence is not a number"))?;

    let action = match opt_string(row, 6)? {
        Some(kind) => Some(Action {
            kind: kind.parse::<ActionKind>().map_err(|e| anyhow!(e))?,
            description: opt_string(row, 7)?.unwrap_or_default(),
            prompt: opt_string(row, 8)?.unwrap_or_default(),
            priority: opt_string(row, 9)?
                .and_then(|p| p.parse().ok())
                .unwrap_or_default(),
        }),
        None => None,
    };

    let execution = match opt_string(row, 10)? {
        Some(outcome) => Some(ExecutionResult {
            outcome: ExecutionOutcome::parse(&outcome)
                .ok_or_else(|| anyhow!("unknown execution outcome {}", outcome))?,
            success: column(row, 11)?.get_bool().unwrap_or(false),
            output: opt_string(row, 12)?.unwrap_or_default(),
            output_truncated: column(row, 13)?.get_bool().unwrap_or(false),
            error: opt_string(row, 14)?,
            duration: Duration::from_micros(column(row, 15)?.get_int().unwrap_or(0).max(0) as u64),
            exit_code: column(row, 16)?.get_int().map(|c| c as i32),
        }),
        None => None,
    };

    Ok(CycleRecord {
        cycle: req_int(row, 0)? as u64,
        at: timestamp(req_int(row, 1)?)?,
        observation_summary: req_str(row, 2)?,
        decision: Decision {
            reasoning: req_str(row, 3)?,
            disposition,
            confidence,
            action,
        },
        execution,
    })
}

fn decode_goal(row: &[DataValue]) -> Result<Goal> {
    Ok(Goal {
        id: req_str(row, 0)?,
        description: req_str(row, 1)?,
        priority: req_str(row, 2)?.parse().unwrap_or_default(),
        created_at: timestamp(req_int(row, 3)?)?,
        completed_at: column(row, 4)?.get_int().map(timestamp).transpose()?,
    })
}
