//! Plan text codec
//!
//! Plans travel as text between the engine, plan generators and humans
//! editing a checkpoint. Two forms are accepted:
//!
//! - JSON: `{"steps": [{"capability": "browse", "instruction": "..."}]}` or a
//!   bare array of such objects (`agent`/`tag` and `task`/`details` are
//!   accepted as aliases)
//! - Lines: one step per line, as `capability: instruction`,
//!   `- [capability] instruction` or `1. capability: instruction`
//!
//! Rendering always produces the JSON form.

use crate::error::{Error, Result};
use helmsman_memory::StepTemplate;
use regex::Regex;
use serde_json::{json, Map, Value};
use std::sync::LazyLock;

static LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:[-*+]|\d+[.)])?\s*(?:\[(?P<bracket>[^\]]+)\]\s*(?P<after>.+)|(?P<tag>[A-Za-z0-9_.-]+)\s*:\s*(?P<rest>.+))$",
    )
    .expect("LINE_RE is a compile-time constant")
});

const CAPABILITY_KEYS: &[&str] = &["capability", "agent", "tag"];
const INSTRUCTION_KEYS: &[&str] = &["instruction", "task", "details", "title"];

/// Parse plan text into step templates. An empty plan is an error.
pub fn parse_plan_text(text: &str) -> Result<Vec<StepTemplate>> {
    let body = strip_fences(text.trim());
    if body.is_empty() {
        return Err(Error::Planning("plan text is empty".to_string()));
    }

    let steps = match serde_json::from_str::<Value>(body) {
        Ok(value) => from_json(&value)?,
        Err(_) => from_lines(body)?,
    };

    if steps.is_empty() {
        return Err(Error::Planning("plan has no steps".to_string()));
    }
    Ok(steps)
}

/// Render steps as canonical JSON plan text
#[must_use]
pub fn render_plan_text(steps: &[StepTemplate]) -> String {
    let value = json!({
        "steps": steps
            .iter()
            .map(|s| json!({"capability": s.capability, "instruction": s.instruction}))
            .collect::<Vec<_>>()
    });
    serde_json::to_string_pretty(&value).unwrap_or_default()
}

fn strip_fences(text: &str) -> &str {
    let Some(inner) = text.strip_prefix("```") else {
        return text;
    };
    // Drop the info string (e.g. "json") on the opening fence
    let inner = inner.split_once('\n').map_or("", |(_, rest)| rest);
    inner.trim_end().trim_end_matches("```").trim()
}

fn from_json(value: &Value) -> Result<Vec<StepTemplate>> {
    let items = match value {
        Value::Array(items) => items,
        Value::Object(map) => match map.get("steps") {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(Error::Planning(
                    "plan object needs a \"steps\" array".to_string(),
                ))
            }
        },
        _ => return Err(Error::Planning("plan JSON must be an object or array".to_string())),
    };

    items
        .iter()
        .enumerate()
        .map(|(i, item)| match item {
            Value::String(line) => parse_line(line.trim()).ok_or_else(|| {
                Error::Planning(format!("step {}: expected `capability: instruction`", i + 1))
            }),
            Value::Object(map) => {
                let capability = field(map, CAPABILITY_KEYS).ok_or_else(|| {
                    Error::Planning(format!("step {}: missing capability", i + 1))
                })?;
                let instruction = field(map, INSTRUCTION_KEYS).ok_or_else(|| {
                    Error::Planning(format!("step {}: missing instruction", i + 1))
                })?;
                Ok(StepTemplate::new(capability, instruction))
            }
            _ => Err(Error::Planning(format!("step {}: unsupported value", i + 1))),
        })
        .collect()
}

fn field<'a>(map: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|k| map.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn from_lines(body: &str) -> Result<Vec<StepTemplate>> {
    body.lines()
        .map(str::trim)
        .enumerate()
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
        .map(|(n, line)| {
            parse_line(line).ok_or_else(|| {
                Error::Planning(format!("line {}: cannot read step from '{line}'", n + 1))
            })
        })
        .collect()
}

fn parse_line(line: &str) -> Option<StepTemplate> {
    let caps = LINE_RE.captures(line)?;
    let (capability, instruction) = match (caps.name("bracket"), caps.name("after")) {
        (Some(tag), Some(rest)) => (tag.as_str(), rest.as_str()),
        _ => (caps.name("tag")?.as_str(), caps.name("rest")?.as_str()),
    };
    let capability = capability.trim();
    let instruction = instruction.trim();
    if capability.is_empty() || instruction.is_empty() {
        return None;
    }
    Some(StepTemplate::new(capability, instruction))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json_object() {
        let text = r#"{"steps": [
            {"capability": "browse", "instruction": "open the pricing page"},
            {"agent": "execute-code", "details": "average the prices"}
        ]}"#;
        let steps = parse_plan_text(text).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1], StepTemplate::new("execute-code", "average the prices"));
    }

    #[test]
    fn test_parse_json_array_in_fence() {
        let text = "```json\n[{\"tag\": \"read-files\", \"task\": \"ls /data\"}]\n```";
        let steps = parse_plan_text(text).unwrap();
        assert_eq!(steps, vec![StepTemplate::new("read-files", "ls /data")]);
    }

    #[test]
    fn test_parse_line_forms() {
        let text = "\
# plan
browse: open the dashboard
- [read-files] read report.csv
2. execute-code: plot totals: by month
";
        let steps = parse_plan_text(text).unwrap();
        assert_eq!(
            steps,
            vec![
                StepTemplate::new("browse", "open the dashboard"),
                StepTemplate::new("read-files", "read report.csv"),
                StepTemplate::new("execute-code", "plot totals: by month"),
            ]
        );
    }

    #[test]
    fn test_empty_plan_is_error() {
        assert!(parse_plan_text("   ").is_err());
        assert!(parse_plan_text(r#"{"steps": []}"#).is_err());
        assert!(parse_plan_text("[]").is_err());
    }

    #[test]
    fn test_malformed_input() {
        assert!(parse_plan_text("just some prose without a tag").is_err());
        assert!(parse_plan_text(r#"{"steps": [{"capability": "browse"}]}"#).is_err());
        assert!(parse_plan_text(r#"{"plan": []}"#).is_err());
    }

    #[test]
    fn test_render_then_parse() {
        let steps = vec![
            StepTemplate::new("browse", "search flights"),
            StepTemplate::new("execute-code", "sort by price"),
        ];
        let text = render_plan_text(&steps);
        assert!(text.contains("\"steps\""));
        assert_eq!(parse_plan_text(&text).unwrap(), steps);
    }
}
