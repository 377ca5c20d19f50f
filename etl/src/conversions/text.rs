use serde_json::Value;

/// Renders a value without JSON quoting, as used by the comma separated encodings and keys.
///
/// Strings are returned as-is, `null` becomes the empty string and everything else is
/// rendered as JSON.
pub fn render_plain(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Converts `user_name` to `userName`.
pub fn to_camel_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper_next = false;

    for (index, c) in name.chars().enumerate() {
        if c == '_' {
            upper_next = index > 0;
            continue;
        }

        if upper_next {
            out.extend(c.to_uppercase());
            upper_next = false;
        } else if out.is_empty() {
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn plain_rendering_strips_quotes() {
        assert_eq!(render_plain(&json!("a")), "a");
        assert_eq!(render_plain(&json!(5)), "5");
        assert_eq!(render_plain(&Value::Null), "");
        assert_eq!(render_plain(&json!({"a": 1})), r#"{"a":1}"#);
    }

    #[test]
    fn camel_case() {
        assert_eq!(to_camel_case("user_name"), "userName");
        assert_eq!(to_camel_case("ID"), "iD");
        assert_eq!(to_camel_case("_private_field"), "privateField");
        assert_eq!(to_camel_case("created_at_utc"), "createdAtUtc");
    }
}
