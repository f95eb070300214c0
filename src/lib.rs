//! OIDA: an autonomous Observe, Infer, Decide, Act loop over a workspace.
//!
//! File changes are batched into observations, a local reasoning endpoint
//! decides what to do, confident decisions are delegated to an external
//! coding agent, and every cycle lands in an append-only audit log.

pub mod core;
pub mod io;
pub mod memory;
pub mod swarm;

pub use crate::core::agent::{AgentExecutor, Delegate, ExecutionOutcome, ExecutionResult};
pub use crate::core::cortex::{Cortex, Reasoner};
pub use crate::core::decision::{Action, ActionKind, Decision, Disposition, Priority, RawDecision};
pub use crate::core::r#loop::Orchestrator;
pub use crate::core::state::{LoopState, OidaConfig};
pub use crate::memory::{CozoStateStore, CycleRecord, Goal, StateStore};
