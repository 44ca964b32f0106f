//! Provider webhook signatures: hex(HMAC-SHA512(raw body, secret)).

use hmac::{Hmac, Mac};
use sha2::Sha512;
use thiserror::Error;

type HmacSha512 = Hmac<Sha512>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature header missing")]
    Missing,

    #[error("signature is not valid hex")]
    Malformed,

    #[error("signature does not match payload")]
    Mismatch,

    #[error("webhook secret is unusable")]
    Key,
}

fn mac(secret: &str, body: &[u8]) -> Result<HmacSha512, SignatureError> {
    let mut mac = HmacSha512::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::Key)?;
    mac.update(body);
    Ok(mac)
}

pub fn sign(secret: &str, body: &[u8]) -> Result<String, SignatureError> {
    Ok(hex::encode(mac(secret, body)?.finalize().into_bytes()))
}

/// Constant-time check of `header` against the body's signature.
pub fn verify(secret: &str, body: &[u8], header: Option<&str>) -> Result<(), SignatureError> {
    let header = header.map(str::trim).filter(|h| !h.is_empty()).ok_or(SignatureError::Missing)?;
    let provided = hex::decode(header).map_err(|_| SignatureError::Malformed)?;
    mac(secret, body)?
        .verify_slice(&provided)
        .map_err(|_| SignatureError::Mismatch)
}
