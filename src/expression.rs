//! Expression Resolution
//!
//! Step parameters may reference sweeping outputs of earlier nodes:
//!
//! ```yaml
//! script: deploy --version <+outputs.VERSION>
//! config: <+outputs.manifest.spec.replicas>
//! ```
//!
//! A string that is exactly one expression is replaced by the referenced
//! value itself; an expression embedded in a longer string is replaced by
//! the value's text. Any expression that cannot be resolved fails the step.

use serde_json::Value;

use crate::error::StepError;
use crate::plan::StepParameters;

const OPEN: &str = "<+";
const CLOSE: char = '>';
const OUTPUTS_ROOT: &str = "outputs";

/// Resolves every expression in `parameters` through `lookup`, which maps
/// an output name to its value.
pub fn resolve_parameters<F>(
    parameters: &StepParameters,
    lookup: F,
) -> Result<StepParameters, StepError>
where
    F: Fn(&str) -> Option<Value>,
{
    let resolved = resolve_value(&parameters.to_value(), &lookup)?;
    StepParameters::from_value(resolved)
        .map_err(|e| StepError::Failed(format!("resolved parameters are invalid: {}", e)))
}

/// Resolves expressions in every string leaf of `value`.
pub fn resolve_value<F>(value: &Value, lookup: &F) -> Result<Value, StepError>
where
    F: Fn(&str) -> Option<Value>,
{
    Ok(match value {
        Value::String(s) => resolve_str(s, lookup)?,
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| resolve_value(item, lookup))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(object) => Value::Object(
            object
                .iter()
                .map(|(k, v)| Ok((k.clone(), resolve_value(v, lookup)?)))
                .collect::<Result<_, StepError>>()?,
        ),
        other => other.clone(),
    })
}

/// True if `s` contains at least one expression.
pub fn has_expressions(s: &str) -> bool {
    s.find(OPEN)
        .map(|start| s[start..].contains(CLOSE))
        .unwrap_or(false)
}

fn resolve_str<F>(s: &str, lookup: &F) -> Result<Value, StepError>
where
    F: Fn(&str) -> Option<Value>,
{
    if !has_expressions(s) {
        return Ok(Value::String(s.to_string()));
    }

    let trimmed = s.trim();
    if let Some(inner) = whole_expression(trimmed) {
        return evaluate(inner, lookup);
    }

    let mut result = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(start) = rest.find(OPEN) {
        result.push_str(&rest[..start]);
        let after_open = &rest[start + OPEN.len()..];
        let Some(end) = after_open.find(CLOSE) else {
            result.push_str(&rest[start..]);
            rest = "";
            break;
        };

        let value = evaluate(&after_open[..end], lookup)?;
        match value {
            Value::String(text) => result.push_str(&text),
            other => result.push_str(&other.to_string()),
        }
        rest = &after_open[end + 1..];
    }
    result.push_str(rest);

    Ok(Value::String(result))
}

/// Inner text if `s` is a single `<+...>` expression and nothing else.
fn whole_expression(s: &str) -> Option<&str> {
    let inner = s.strip_prefix(OPEN)?.strip_suffix(CLOSE)?;
    if inner.contains(OPEN) || inner.contains(CLOSE) {
        return None;
    }
    Some(inner)
}

/// Evaluates `outputs.NAME[.path...]`.
fn evaluate<F>(expression: &str, lookup: &F) -> Result<Value, StepError>
where
    F: Fn(&str) -> Option<Value>,
{
    let unresolved = || StepError::UnresolvedExpression(format!("{}{}{}", OPEN, expression, CLOSE));

    let mut segments = expression.trim().split('.');
    if segments.next() != Some(OUTPUTS_ROOT) {
        return Err(unresolved());
    }
    let name = segments.next().filter(|n| !n.is_empty()).ok_or_else(unresolved)?;
    let mut value = lookup(name).ok_or_else(unresolved)?;

    for segment in segments {
        value = match &value {
            Value::Object(object) => object.get(segment).cloned(),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i).cloned()),
            _ => None,
        }
        .ok_or_else(unresolved)?;
    }

    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::ShellParameters;
    use serde_json::json;

    fn lookup(name: &str) -> Option<Value> {
        match name {
            "VERSION" => Some(json!("1.2.3")),
            "manifest" => Some(json!({"spec": {"replicas": 3, "hosts": ["a", "b"]}})),
            _ => None,
        }
    }

    #[test]
    fn test_whole_string_keeps_type() {
        let value = resolve_value(&json!("<+outputs.manifest.spec.replicas>"), &lookup).unwrap();
        assert_eq!(value, json!(3));
    }

    #[test]
    fn test_inline_expressions() {
        let value = resolve_value(
            &json!("deploy <+outputs.VERSION> to <+outputs.manifest.spec.hosts.1>"),
            &lookup,
        )
        .unwrap();
        assert_eq!(value, json!("deploy 1.2.3 to b"));
    }

    #[test]
    fn test_nested_structures() {
        let value = resolve_value(
            &json!({"env": {"V": "<+outputs.VERSION>"}, "list": ["x", "<+outputs.VERSION>"]}),
            &lookup,
        )
        .unwrap();
        assert_eq!(value["env"]["V"], "1.2.3");
        assert_eq!(value["list"][1], "1.2.3");
    }

    #[test]
    fn test_unresolvable_fails() {
        let err = resolve_value(&json!("<+outputs.MISSING>"), &lookup).unwrap_err();
        assert_eq!(
            err,
            StepError::UnresolvedExpression("<+outputs.MISSING>".to_string())
        );
        assert!(resolve_value(&json!("<+pipeline.name>"), &lookup).is_err());
        assert!(resolve_value(&json!("<+outputs.manifest.nope>"), &lookup).is_err());
    }

    #[test]
    fn test_plain_strings_untouched() {
        assert_eq!(resolve_value(&json!("a > b"), &lookup).unwrap(), json!("a > b"));
        assert!(!has_expressions("echo <+"));
        assert!(has_expressions("<+outputs.X>"));
    }

    #[test]
    fn test_resolve_shell_parameters() {
        let params = StepParameters::Shell(ShellParameters {
            script: "echo <+outputs.VERSION>".into(),
            ..Default::default()
        });
        match resolve_parameters(&params, lookup).unwrap() {
            StepParameters::Shell(shell) => assert_eq!(shell.script, "echo 1.2.3"),
            other => panic!("unexpected parameters {:?}", other),
        }
    }
}
