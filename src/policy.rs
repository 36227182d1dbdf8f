//! Password policy validation.
//!
//! Pure checks, run before any credential or store call is made. The first
//! failing rule wins so the user gets a single actionable message.

use crate::error::{Error, Result};

/// Minimum password length accepted by the policy.
pub const MIN_PASSWORD_LENGTH: usize = 8;

/// Validate a password against the account policy.
///
/// Returns `Error::Validation` with a human-readable reason on the first
/// rule the password fails.
pub fn validate_password(password: &str) -> Result<()> {
    if password.chars().count() < MIN_PASSWORD_LENGTH {
        return Err(Error::Validation(format!(
            "Password must be at least {MIN_PASSWORD_LENGTH} characters long"
        )));
    }
    if !password.chars().any(|c| c.is_ascii_uppercase()) {
        return Err(Error::Validation(
            "Password must contain at least one uppercase letter".into(),
        ));
    }
    if !password.chars().any(|c| c.is_ascii_lowercase()) {
        return Err(Error::Validation(
            "Password must contain at least one lowercase letter".into(),
        ));
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        return Err(Error::Validation(
            "Password must contain at least one number".into(),
        ));
    }
    if !password.chars().any(|c| !c.is_ascii_alphanumeric()) {
        return Err(Error::Validation(
            "Password must contain at least one special character".into(),
        ));
    }
    Ok(())
}
