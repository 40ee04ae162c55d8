pub mod http_jsonrpc;
pub mod http_sse;
pub mod stdio;

use serde_json::Value;

/// Tool-call arguments arrive from `ToolCallAssembler` as raw accumulated
/// JSON text (possibly empty, possibly malformed if the provider truncated
/// a stream mid-call). Downstream transports want a `Value`, so empty or
/// unparsable input normalizes to an empty object rather than failing the
/// call outright.
pub fn normalize_arguments(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Value::Object(Default::default());
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::Object(Default::default()))
}

/// Reduce one already-decoded JSON chunk value to displayable text, for
/// transports (stdio) that hand back a bare value instead of going through
/// `http_sse::extract_chunk`. A list of strings concatenates; a list with
/// any non-string element, or any other shape, falls back to compact JSON so
/// nothing is silently dropped.
pub fn normalize_chunk(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Array(items) => {
            let all_strings = items.iter().all(|v| v.is_string());
            if all_strings {
                items
                    .iter()
                    .map(|v| v.as_str().unwrap_or_default())
                    .collect()
            } else {
                value.to_string()
            }
        }
        other => other.to_string(),
    }
}
