use serde_json::{Map, Value};

/// JSON object found at the tail of a finished session's buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredResult {
    value: Map<String, Value>,
}

impl StructuredResult {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.value.get(key)
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.value)
    }
}

/// Parses everything from the first `{` to the end of `buffer` as one JSON object.
///
/// A `{` that appears in ordinary text before the real payload makes the parse
/// fail; that is accepted behaviour and yields `None`, as does a buffer with no
/// payload at all. Pure and safe to call repeatedly.
pub fn parse_trailing_payload(buffer: &str) -> Option<StructuredResult> {
    let start = buffer.find('{')?;
    match serde_json::from_str::<Map<String, Value>>(&buffer[start..]) {
        Ok(value) => Some(StructuredResult { value }),
        Err(error) => {
            tracing::trace!(%error, offset = start, "no trailing payload");
            None
        }
    }
}
