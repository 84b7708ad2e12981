//! Strict decoding of the oracle's repair plan.
//!
//! The response may wrap the JSON in prose or a fenced block. The first
//! balanced JSON object is extracted, checked against the plan schema and then
//! decoded; any mismatch is a [`EngineError::PlanParse`], never a guess.

use jsonschema::Draft;
use serde_json::Value;

use crate::core::types::RepairPlan;
use crate::error::EngineError;

/// JSON Schema the plan must satisfy. Also embedded in the plan prompt.
pub const REPAIR_PLAN_SCHEMA: &str = include_str!("../../schemas/repair_plan.schema.json");

/// Decode a repair plan from a raw oracle response.
pub fn decode_plan(response: &str) -> Result<RepairPlan, EngineError> {
    let fail = |reason: String| EngineError::PlanParse {
        reason,
        response: response.to_string(),
    };

    let fragment = extract_json_object(response)
        .ok_or_else(|| fail("no JSON object found in response".to_string()))?;
    let instance: Value =
        serde_json::from_str(fragment).map_err(|err| fail(format!("invalid JSON: {err}")))?;

    let schema: Value = serde_json::from_str(REPAIR_PLAN_SCHEMA)
        .map_err(|err| fail(format!("plan schema is not JSON: {err}")))?;
    let validator = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .map_err(|err| fail(format!("compile plan schema: {err}")))?;
    let messages: Vec<String> = validator
        .iter_errors(&instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(fail(format!(
            "schema validation failed:\n- {}",
            messages.join("\n- ")
        )));
    }

    serde_json::from_value(instance).map_err(|err| fail(format!("decode plan: {err}")))
}

/// Find the first balanced `{...}` in `text`, ignoring braces inside strings.
fn extract_json_object(text: &str) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;
    let mut start = None;

    for (i, c) in text.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        if in_string {
            match c {
                '\\' => escape_next = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' if start.is_some() => in_string = true,
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    return start.map(|s| &text[s..=i]);
                }
            }
            _ => {}
        }
    }
    None
}
