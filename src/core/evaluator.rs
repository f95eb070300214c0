//! Decision Evaluator
//!
//! Turns whatever the reasoning step produced into a [`Decision`] that holds
//! the act invariant: an action is attached if and only if the disposition
//! is `act` and confidence reaches the configured threshold.

use crate::core::decision::{Decision, DecisionDraft, Disposition, FailureKind, RawDecision};

pub const PARSE_FAILURE_REASONING: &str = "parse failure";
pub const TRANSPORT_FAILURE_REASONING: &str = "reasoning endpoint unavailable";

pub fn evaluate(raw: RawDecision, threshold: f64) -> Decision {
    match raw {
        RawDecision::Parsed(draft) => evaluate_draft(draft, threshold),
        RawDecision::Failed { kind, detail } => {
            let prefix = match kind {
                FailureKind::Parse => PARSE_FAILURE_REASONING,
                FailureKind::Transport => TRANSPORT_FAILURE_REASONING,
            };
            Decision::investigate(format!("{}: {}", prefix, detail), 0.0)
        }
    }
}

fn evaluate_draft(draft: DecisionDraft, threshold: f64) -> Decision {
    let DecisionDraft {
        reasoning,
        disposition,
        confidence,
        action,
    } = draft;

    match (disposition, action) {
        // Promising but not yet actionable.
        (Disposition::Act, _) if confidence < threshold => Decision {
            reasoning,
            disposition: Disposition::Investigate,
            confidence,
            action: None,
        },
        (Disposition::Act, Some(action)) => Decision {
            reasoning,
            disposition: Disposition::Act,
            confidence,
            action: Some(action),
        },
        // Confident act with nothing to do, or an action riding on a non-act
        // disposition: the invariant is broken, fall back to wait.
        (Disposition::Act, None) | (_, Some(_)) => Decision {
            reasoning,
            disposition: Disposition::Wait,
            confidence,
            action: None,
        },
        (disposition, None) => Decision {
            reasoning,
            disposition,
            confidence,
            action: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::decision::{Action, ActionKind, Priority};

    fn action() -> Action {
        Action {
            kind: ActionKind::SingleAgent,
            description: "reindex".to_string(),
            prompt: "update index".to_string(),
            priority: Priority::High,
        }
    }

    fn draft(disposition: Disposition, confidence: f64, action: Option<Action>) -> RawDecision {
        RawDecision::Parsed(DecisionDraft {
            reasoning: "because".to_string(),
            disposition,
            confidence,
            action,
        })
    }

    #[test]
    fn test_confident_act_passes_through() {
        let d = evaluate(draft(Disposition::Act, 0.9, Some(action())), 0.7);
        assert_eq!(d.disposition, Disposition::Act);
        assert_eq!(d.action, Some(action()));
    }

    #[test]
    fn test_act_at_exact_threshold_is_allowed() {
        let d = evaluate(draft(Disposition::Act, 0.7, Some(action())), 0.7);
        assert_eq!(d.disposition, Disposition::Act);
    }

    #[test]
    fn test_low_confidence_act_becomes_investigate() {
        for confidence in [0.0, 0.3, 0.69] {
            for a in [Some(action()), None] {
                let d = evaluate(draft(Disposition::Act, confidence, a), 0.7);
                assert_eq!(d.disposition, Disposition::Investigate);
                assert!(d.action.is_none());
                assert_eq!(d.confidence, confidence);
            }
        }
    }

    #[test]
    fn test_invariant_violations_become_wait() {
        let d = evaluate(draft(Disposition::Act, 0.95, None), 0.7);
        assert_eq!(d.disposition, Disposition::Wait);

        let d = evaluate(draft(Disposition::Investigate, 0.95, Some(action())), 0.7);
        assert_eq!(d.disposition, Disposition::Wait);
        assert!(d.action.is_none());
    }

    #[test]
    fn test_wait_passes_through_unchanged() {
        let d = evaluate(draft(Disposition::Wait, 0.4, None), 0.7);
        assert_eq!(d.disposition, Disposition::Wait);
        assert_eq!(d.confidence, 0.4);
        assert_eq!(d.reasoning, "because");
    }

    #[test]
    fn test_failures_degrade_to_zero_confidence_investigate() {
        let d = evaluate(
            RawDecision::Failed {
                kind: FailureKind::Parse,
                detail: "no JSON".to_string(),
            },
            0.7,
        );
        assert_eq!(d.disposition, Disposition::Investigate);
        assert_eq!(d.confidence, 0.0);
        assert!(d.reasoning.starts_with(PARSE_FAILURE_REASONING));

        let d = evaluate(
            RawDecision::Failed {
                kind: FailureKind::Transport,
                detail: "connection refused".to_string(),
            },
            0.7,
        );
        assert!(d.reasoning.starts_with(TRANSPORT_FAILURE_REASONING));
        assert!(d.action.is_none());
    }
}
