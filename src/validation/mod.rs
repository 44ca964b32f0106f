use bigdecimal::BigDecimal;
use std::fmt;

use crate::domain::money;

pub const REASON_MAX_LEN: usize = 255;
pub const NARRATION_MAX_LEN: usize = 100;
pub const EMAIL_MAX_LEN: usize = 254;
pub const REFERENCE_MAX_LEN: usize = 100;
pub const PIN_MIN_LEN: usize = 4;
pub const PIN_MAX_LEN: usize = 6;
pub const OTP_MAX_LEN: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

pub type ValidationResult = Result<(), ValidationError>;

pub fn sanitize_string(value: &str) -> String {
    value
        .chars()
        .filter(|ch| !ch.is_control())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn validate_required(field: &'static str, value: &str) -> ValidationResult {
    if value.trim().is_empty() {
        return Err(ValidationError::new(field, "must not be empty"));
    }

    Ok(())
}

pub fn validate_max_len(field: &'static str, value: &str, max_len: usize) -> ValidationResult {
    if value.len() > max_len {
        return Err(ValidationError::new(
            field,
            format!("must be at most {} characters", max_len),
        ));
    }

    Ok(())
}

/// Positive and no finer than the ledger's two decimal places.
pub fn validate_amount(field: &'static str, amount: &BigDecimal) -> ValidationResult {
    if amount <= &money::zero() {
        return Err(ValidationError::new(field, "must be greater than zero"));
    }

    if !money::has_minor_precision(amount) {
        return Err(ValidationError::new(
            field,
            "must have at most two decimal places",
        ));
    }

    Ok(())
}

pub fn validate_pin(pin: &str) -> ValidationResult {
    if pin.len() < PIN_MIN_LEN || pin.len() > PIN_MAX_LEN {
        return Err(ValidationError::new(
            "pin",
            format!("must be {} to {} digits", PIN_MIN_LEN, PIN_MAX_LEN),
        ));
    }

    if !pin.chars().all(|ch| ch.is_ascii_digit()) {
        return Err(ValidationError::new("pin", "must contain only digits"));
    }

    Ok(())
}

pub fn validate_otp(otp: &str) -> ValidationResult {
    validate_required("otp", otp)?;
    validate_max_len("otp", otp, OTP_MAX_LEN)?;

    if !otp.chars().all(|ch| ch.is_ascii_digit()) {
        return Err(ValidationError::new("otp", "must contain only digits"));
    }

    Ok(())
}

pub fn validate_email(email: &str) -> ValidationResult {
    validate_required("email", email)?;
    validate_max_len("email", email, EMAIL_MAX_LEN)?;

    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(()),
        _ => Err(ValidationError::new("email", "must be a valid email address")),
    }
}

pub fn validate_reference(field: &'static str, reference: &str) -> ValidationResult {
    validate_required(field, reference)?;
    validate_max_len(field, reference, REFERENCE_MAX_LEN)?;

    if !reference
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
    {
        return Err(ValidationError::new(
            field,
            "must contain only letters, digits, '-' and '_'",
        ));
    }

    Ok(())
}

pub fn validate_callback_url(url: &str) -> ValidationResult {
    match url::Url::parse(url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(()),
        _ => Err(ValidationError::new(
            "redirect_url",
            "must be an absolute http(s) URL",
        )),
    }
}
