//! Environment-supplied configuration.

use crate::error::{Error, Result};
use secrecy::SecretString;
use std::path::Path;

/// Environment variable holding the store password.
pub const PASSWORD_ENV: &str = "KOPI_PASSWORD";

/// Environment variable holding the log level or filter directive.
pub const LOG_LEVEL_ENV: &str = "KOPI_LOG_LEVEL";

/// Read the password from `KOPI_PASSWORD` when encryption is requested.
///
/// Returns `None` when `required` is false. A missing variable while
/// encryption is requested is a configuration error.
pub fn password_from_env(required: bool) -> Result<Option<SecretString>> {
    password_from(std::env::var(PASSWORD_ENV).ok(), required)
}

/// As `password_from_env`, with the variable's value supplied by the caller.
pub fn password_from(value: Option<String>, required: bool) -> Result<Option<SecretString>> {
    if !required {
        return Ok(None);
    }
    match value {
        Some(password) => Ok(Some(SecretString::from(password))),
        None => Err(Error::config(format!(
            "encryption requested but {} is not set",
            PASSWORD_ENV
        ))),
    }
}

/// Reject an empty path argument.
pub fn require_path(what: &str, path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(Error::config(format!("{} cannot be empty", what)));
    }
    Ok(())
}
