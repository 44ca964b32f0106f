use serde_json::Value;

const MASK: &str = "****";

/// Copy of `value` with account numbers, PINs, OTPs and credentials masked.
/// Used before any request body reaches the log.
pub fn sanitize_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, val)| {
                    let masked = match field_kind(key) {
                        Some(Sensitive::Email) => mask_email(val),
                        Some(Sensitive::Partial) => mask_edges(val),
                        Some(Sensitive::Full) => Value::String(MASK.to_string()),
                        None => sanitize_json(val),
                    };
                    (key.clone(), masked)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(sanitize_json).collect()),
        _ => value.clone(),
    }
}

enum Sensitive {
    /// Keep the first and last four characters.
    Partial,
    Full,
    Email,
}

fn field_kind(key: &str) -> Option<Sensitive> {
    let key = key.to_ascii_lowercase().replace(['_', '-'], "");
    match key.as_str() {
        "accountnumber" | "authorizationcode" => Some(Sensitive::Partial),
        "pin" | "otp" | "authorization" | "secret" | "token" | "secretkey" => Some(Sensitive::Full),
        "email" | "buyeremail" => Some(Sensitive::Email),
        _ => None,
    }
}

fn mask_edges(value: &Value) -> Value {
    let Value::String(s) = value else {
        return Value::String(MASK.to_string());
    };
    let chars: Vec<char> = s.chars().collect();
    if chars.len() <= 8 {
        return Value::String(MASK.to_string());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    Value::String(format!("{}{}{}", head, MASK, tail))
}

fn mask_email(value: &Value) -> Value {
    match value {
        Value::String(s) => match s.split_once('@') {
            Some((local, domain)) => {
                let first: String = local.chars().take(1).collect();
                Value::String(format!("{}{}@{}", first, MASK, domain))
            }
            None => Value::String(MASK.to_string()),
        },
        _ => Value::String(MASK.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sanitize_withdrawal_request() {
        let input = json!({
            "amount": "5000.00",
            "pin": "1234",
            "bank": { "account_number": "0123456789", "bank_code": "058" }
        });

        let sanitized = sanitize_json(&input);

        assert_eq!(sanitized["pin"], "****");
        assert_eq!(sanitized["bank"]["account_number"], "0123****6789");
        assert_eq!(sanitized["bank"]["bank_code"], "058");
        assert_eq!(sanitized["amount"], "5000.00");
    }

    #[test]
    fn test_sanitize_email_keeps_domain() {
        let sanitized = sanitize_json(&json!({ "buyerEmail": "ada@example.com", "account-number": "0123456789" }));
        assert_eq!(sanitized["buyerEmail"], "a****@example.com");
        assert_eq!(sanitized["account-number"], "0123****6789");
    }

    #[test]
    fn test_multibyte_values_do_not_panic() {
        let sanitized = sanitize_json(&json!({ "accountNumber": "ééééééééééé" }));
        assert_eq!(sanitized["accountNumber"], "éééé****éééé");
    }

    #[test]
    fn test_sanitize_arrays() {
        let input = json!([{ "otp": "123456" }, { "note": "ok" }]);
        let sanitized = sanitize_json(&input);
        assert_eq!(sanitized[0]["otp"], "****");
        assert_eq!(sanitized[1]["note"], "ok");
    }
}
