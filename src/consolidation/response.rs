//! Locating and reading JSON inside free-form collaborator output.

use serde_json::Value;

/// Find the first JSON value in `text`: the whole text, a fenced code block,
/// or the first `{…}` / `[…]` value embedded in prose. Returns `None` if
/// nothing parses.
pub fn find_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }

    if let Some(block) = fenced_block(trimmed) {
        if let Ok(value) = serde_json::from_str(block) {
            return Some(value);
        }
    }

    trimmed
        .match_indices(['{', '['])
        .find_map(|(start, _)| leading_value(&trimmed[start..]))
}

/// Parse one JSON value at the start of `text`, ignoring whatever follows it.
fn leading_value(text: &str) -> Option<Value> {
    serde_json::Deserializer::from_str(text)
        .into_iter::<Value>()
        .next()?
        .ok()
}

fn fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")? + 3;
    let rest = &text[start..];
    // Skip an info string such as `json`.
    let body_start = rest.find('\n').map_or(0, |i| i + 1);
    let body = &rest[body_start..];
    let end = body.find("```")?;
    Some(body[..end].trim())
}

/// A non-empty trimmed string field.
pub fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// A numeric field clamped to `[0, 1]`. Numeric strings are accepted.
pub fn unit_field(value: &Value, key: &str) -> Option<f64> {
    let field = value.get(key)?;
    let n = field
        .as_f64()
        .or_else(|| field.as_str().and_then(|s| s.trim().parse().ok()))?;
    n.is_finite().then(|| n.clamp(0.0, 1.0))
}

/// A list of strings; non-string items are dropped.
pub fn string_list(value: &Value, key: &str) -> Option<Vec<String>> {
    let items = value.get(key)?.as_array()?;
    Some(
        items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
    )
}
