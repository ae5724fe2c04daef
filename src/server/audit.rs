//! Redaction of secrets in audit log lines

use serde_json::Value;

pub fn redact_audit_params(params: Option<&Value>) -> Value {
    params.map(redact_audit_value).unwrap_or(Value::Null)
}

pub fn redact_audit_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| {
                    if is_sensitive_key(key) {
                        (key.clone(), Value::String("[REDACTED]".to_string()))
                    } else {
                        (key.clone(), redact_audit_value(item))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_audit_value).collect()),
        _ => value.clone(),
    }
}

pub fn is_sensitive_key(key: &str) -> bool {
    let normalized = key.trim().to_ascii_lowercase();
    matches!(
        normalized.as_str(),
        "authorization" | "bearer" | "credentials" | "credential" | "api_key" | "apikey"
    ) || ["token", "secret", "password", "credential"]
        .iter()
        .any(|needle| normalized.contains(needle))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn redacts_sensitive_fields_at_any_depth() {
        let params = json!({
            "name": "deploy",
            "arguments": {
                "target": "staging",
                "token": "should-not-appear",
                "api_key": "should-not-appear",
                "steps": [{"db_password": "should-not-appear", "name": "migrate"}],
                "nested": {"client_secret": "should-not-appear"}
            }
        });

        let redacted = redact_audit_params(Some(&params));

        assert_eq!(redacted["name"], json!("deploy"));
        assert_eq!(redacted["arguments"]["target"], json!("staging"));
        assert_eq!(redacted["arguments"]["token"], json!("[REDACTED]"));
        assert_eq!(redacted["arguments"]["api_key"], json!("[REDACTED]"));
        assert_eq!(redacted["arguments"]["steps"][0]["db_password"], json!("[REDACTED]"));
        assert_eq!(redacted["arguments"]["steps"][0]["name"], json!("migrate"));
        assert_eq!(
            redacted["arguments"]["nested"]["client_secret"],
            json!("[REDACTED]")
        );
    }

    #[test]
    fn missing_params_audit_as_null() {
        assert_eq!(redact_audit_params(None), Value::Null);
    }
}
