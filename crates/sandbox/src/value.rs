//! Materialisation and rendering of interpreter values.

use rquickjs::{Ctx, Value};
use serde_json::{Map, Number, Value as JsonValue};

/// Decode depth cap; cyclic structures bottom out as a placeholder.
const MAX_DECODE_DEPTH: usize = 16;

/// Decode a settled interpreter value into host JSON.
///
/// `None` means `undefined`: the caller renders nothing for it.
pub fn decode_value(ctx: &Ctx<'_>, value: &Value<'_>) -> Option<JsonValue> {
    decode_at_depth(ctx, value, 0)
}

fn decode_at_depth(ctx: &Ctx<'_>, value: &Value<'_>, depth: usize) -> Option<JsonValue> {
    if value.is_undefined() {
        return None;
    }
    if value.is_null() {
        return Some(JsonValue::Null);
    }
    if let Some(flag) = value.as_bool() {
        return Some(JsonValue::Bool(flag));
    }
    if let Some(int) = value.as_int() {
        return Some(JsonValue::Number(Number::from(int)));
    }
    if let Some(float) = value.as_float() {
        return Some(match Number::from_f64(float) {
            Some(number) => JsonValue::Number(number),
            // NaN and infinities have no JSON form.
            None => JsonValue::String(float.to_string()),
        });
    }
    if let Some(string) = value.as_string() {
        return Some(JsonValue::String(
            string.to_string().unwrap_or_else(|_| String::new()),
        ));
    }
    if value.is_function() {
        return Some(JsonValue::String("[function]".to_string()));
    }
    if value.is_symbol() {
        return Some(JsonValue::String("[symbol]".to_string()));
    }
    if depth >= MAX_DECODE_DEPTH {
        return Some(JsonValue::String("…".to_string()));
    }
    if let Some(array) = value.as_array() {
        let mut items = Vec::with_capacity(array.len());
        for item in array.iter::<Value>() {
            match item {
                Ok(item) => {
                    items.push(decode_at_depth(ctx, &item, depth + 1).unwrap_or(JsonValue::Null));
                }
                Err(_) => items.push(JsonValue::Null),
            }
        }
        return Some(JsonValue::Array(items));
    }
    if let Some(object) = value.as_object() {
        let mut map = Map::new();
        for entry in object.props::<String, Value>() {
            let Ok((key, item)) = entry else { continue };
            if let Some(decoded) = decode_at_depth(ctx, &item, depth + 1) {
                map.insert(key, decoded);
            }
        }
        return Some(JsonValue::Object(map));
    }
    Some(JsonValue::String("[value]".to_string()))
}

/// Render a decoded value for the `"=> "` suffix of a reply.
///
/// Strings render bare, scalars via their printable form, structured
/// values as multi-line JSON.
pub fn render_value(value: &JsonValue) -> String {
    match value {
        JsonValue::String(text) => text.clone(),
        JsonValue::Array(_) | JsonValue::Object(_) => {
            serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
        }
        other => other.to_string(),
    }
}

/// Single-line form used when joining `console.log` arguments.
pub fn console_form(value: Option<&JsonValue>) -> String {
    match value {
        None => "undefined".to_string(),
        Some(JsonValue::String(text)) => text.clone(),
        Some(structured @ (JsonValue::Array(_) | JsonValue::Object(_))) => {
            serde_json::to_string(structured).unwrap_or_else(|_| structured.to_string())
        }
        Some(other) => other.to_string(),
    }
}
