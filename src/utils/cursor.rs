use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use uuid::Uuid;

/// Cursor helpers: encode/decode a (sequence, id) pair of a ledger entry.
/// Format used internally: "{sequence}|{uuid}" then URL-safe base64 encoded.

pub fn encode(sequence: i64, id: Uuid) -> String {
    URL_SAFE_NO_PAD.encode(format!("{}|{}", sequence, id))
}

pub fn decode(cursor: &str) -> Result<(i64, Uuid), String> {
    let decoded = URL_SAFE_NO_PAD
        .decode(cursor)
        .map_err(|e| format!("base64 decode error: {}", e))?;
    let s = String::from_utf8(decoded).map_err(|e| format!("utf8 error: {}", e))?;
    let (sequence, id) = s
        .split_once('|')
        .ok_or_else(|| "missing id in cursor".to_string())?;
    let sequence = sequence
        .parse::<i64>()
        .map_err(|e| format!("sequence parse error: {}", e))?;
    let id = Uuid::parse_str(id).map_err(|e| format!("uuid parse error: {}", e))?;
    Ok((sequence, id))
}
