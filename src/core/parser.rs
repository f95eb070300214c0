use crate::core::decision::{DecisionDraft, FailureKind, RawDecision};
use serde_json::Value;

/// Parses the reasoning engine's reply into a tagged result.
///
/// The reply should be a bare JSON object, but fenced ```json blocks and
/// prose around a single object are tolerated. Anything that fails the
/// schema (unknown disposition, missing field, confidence outside [0, 1])
/// comes back as `RawDecision::Failed` with `FailureKind::Parse`.
pub fn parse_decision(response: &str) -> RawDecision {
    let candidates = json_candidates(response);
    if candidates.is_empty() {
        return parse_failure("reply contains no JSON object");
    }

    let mut last_error = String::new();
    for candidate in candidates {
        match serde_json::from_str::<Value>(candidate) {
            Ok(value) => match draft_from_value(value) {
                Ok(draft) => return RawDecision::Parsed(draft),
                Err(e) => last_error = e,
            },
            Err(e) => last_error = format!("invalid JSON: {}", e),
        }
    }
    parse_failure(last_error)
}

fn draft_from_value(value: Value) -> Result<DecisionDraft, String> {
    if !value.is_object() {
        return Err("decision must be a JSON object".to_string());
    }
    let draft: DecisionDraft =
        serde_json::from_value(value).map_err(|e| format!("schema violation: {}", e))?;
    if !draft.confidence.is_finite() || !(0.0..=1.0).contains(&draft.confidence) {
        return Err(format!("confidence {} outside [0, 1]", draft.confidence));
    }
    Ok(draft)
}

fn parse_failure(detail: impl Into<String>) -> RawDecision {
    RawDecision::Failed {
        kind: FailureKind::Parse,
        detail: detail.into(),
    }
}

/// Candidate JSON texts in priority order: fenced blocks, the whole reply,
/// then the outermost `{ ... }` span.
fn json_candidates(response: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start_idx = 0;

    while let Some(start) = response[start_idx..].find("```") {
        let fence_start = start_idx + start + 3;
        // Skip an info string such as `json`
        let body_start = match response[fence_start..].find('\n') {
            Some(nl) => fence_start + nl + 1,
            None => break,
        };
        match response[body_start..].find("```") {
            Some(end) => {
                let body = response[body_start..body_start + end].trim();
                if !body.is_empty() {
                    out.push(body);
                }
                start_idx = body_start + end + 3;
            }
            None => break,
        }
    }

    let trimmed = response.trim();
    if trimmed.starts_with('{') {
        out.push(trimmed);
    }

    if let (Some(open), Some(close)) = (response.find('{'), response.rfind('}')) {
        if open < close {
            let span = &response[open..=close];
            if !out.contains(&span) {
                out.push(span);
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::decision::{ActionKind, Disposition};

    fn parsed(resp: &str) -> DecisionDraft {
        match parse_decision(resp) {
            RawDecision::Parsed(d) => d,
            other => panic!("expected parsed decision, got {:?}", other),
        }
    }

    fn failed(resp: &str) -> String {
        match parse_decision(resp) {
            RawDecision::Failed { kind, detail } => {
                assert_eq!(kind, FailureKind::Parse);
                detail
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_bare_object() {
        let draft = parsed(
            r#"{"reasoning": "notes changed", "decision": "wait", "confidence": 0.4, "action": null}"#,
        );
        assert_eq!(draft.disposition, Disposition::Wait);
        assert!(draft.action.is_none());
    }

    #[test]
    fn test_parse_fenced_block_with_prose() {
        let resp = r#"
Here is my decision:
```json
{
  "reasoning": "index is stale",
  "decision": "act",
  "confidence": 0.9,
  "action": {"type": "single-agent", "description": "reindex", "prompt": "update index", "priority": "high"}
}
```
        "#;
        let draft = parsed(resp);
        assert_eq!(draft.disposition, Disposition::Act);
        let action = draft.action.unwrap();
        assert_eq!(action.kind, ActionKind::SingleAgent);
        assert_eq!(action.prompt, "update index");
    }

    #[test]
    fn test_parse_object_embedded_in_text() {
        let draft = parsed(
            r#"Sure. {"reasoning": "r", "decision": "investigate", "confidence": 0.5} Done."#,
        );
        assert_eq!(draft.disposition, Disposition::Investigate);
    }

    #[test]
    fn test_schema_violations_are_failures() {
        assert!(failed("I think we should wait.").contains("no JSON"));
        assert!(failed(r#"{"reasoning": "r", "decision": "panic", "confidence": 0.5}"#)
            .contains("schema"));
        assert!(failed(r#"{"decision": "wait", "confidence": 0.5}"#).contains("schema"));
        assert!(failed(r#"{"reasoning": "r", "decision": "act", "confidence": 1.5}"#)
            .contains("outside"));
        assert!(failed(r#"{"reasoning": "r", "decision": "wait", "confidence": 0.2"#)
            .contains("invalid JSON"));
    }
}
