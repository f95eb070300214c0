use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Disposition {
    Act,
    Wait,
    Investigate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    #[serde(alias = "single_agent", alias = "agent")]
    SingleAgent,
    #[serde(alias = "multi_agent_swarm", alias = "swarm")]
    MultiAgentSwarm,
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// A request for delegated execution. The loop never looks inside `prompt`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub kind: ActionKind,
    #[serde(default)]
    pub description: String,
    pub prompt: String,
    #[serde(default)]
    pub priority: Priority,
}

/// A validated decision. Only [`crate::core::evaluator::evaluate`] builds
/// one from model output, so `action.is_some()` implies `disposition == Act`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub reasoning: String,
    pub disposition: Disposition,
    pub confidence: f64,
    pub action: Option<Action>,
}

impl Decision {
    /// A decision that takes no action this cycle.
    pub fn wait(reasoning: impl Into<String>) -> Self {
        Self {
            reasoning: reasoning.into(),
            disposition: Disposition::Wait,
            confidence: 0.0,
            action: None,
        }
    }

    pub fn investigate(reasoning: impl Into<String>, confidence: f64) -> Self {
        Self {
            reasoning: reasoning.into(),
            disposition: Disposition::Investigate,
            confidence,
            action: None,
        }
    }
}

/// What the reasoning engine claimed, before any invariant is enforced.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DecisionDraft {
    pub reasoning: String,
    #[serde(rename = "decision")]
    pub disposition: Disposition,
    pub confidence: f64,
    #[serde(default)]
    pub action: Option<Action>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The reply never parsed into a draft.
    Parse,
    /// The endpoint could not be reached or answered with an error.
    Transport,
}

/// Outcome of one `think` call. Callers must handle both branches.
#[derive(Debug, Clone, PartialEq)]
pub enum RawDecision {
    Parsed(DecisionDraft),
    Failed { kind: FailureKind, detail: String },
}

macro_rules! str_enum {
    ($ty:ty { $($variant:path => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self { $($variant => $text),+ }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($variant),)+
                    other => Err(format!("unknown {}: {}", stringify!($ty), other)),
                }
            }
        }
    };
}

str_enum!(Disposition {
    Disposition::Act => "act",
    Disposition::Wait => "wait",
    Disposition::Investigate => "investigate",
});

str_enum!(ActionKind {
    ActionKind::SingleAgent => "single-agent",
    ActionKind::MultiAgentSwarm => "multi-agent-swarm",
    ActionKind::Internal => "internal",
});

str_enum!(Priority {
    Priority::Low => "low",
    Priority::Medium => "medium",
    Priority::High => "high",
    Priority::Critical => "critical",
});
