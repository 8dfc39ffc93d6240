//! Form validation shared by registration, offers and redemption

use crate::config::AppConfig;
use crate::error::Error;

/// Reject empty or whitespace-only text
pub fn require_text(field: &str, value: &str) -> Result<(), Error> {
    if value.trim().is_empty() {
        return Err(Error::invalid(format!("{field} must not be empty")));
    }
    Ok(())
}

/// Loose email shape check: one `@`, a non-empty local part and a dotted domain
pub fn validate_email(email: &str) -> Result<(), Error> {
    let email = email.trim();
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && !email.contains(char::is_whitespace)
                && domain
                    .split('.')
                    .filter(|label| !label.is_empty())
                    .count()
                    >= 2
                && !domain.starts_with('.')
                && !domain.ends_with('.')
        }
        None => false,
    };

    if valid {
        Ok(())
    } else {
        Err(Error::invalid(format!("'{email}' is not a valid email address")))
    }
}

pub fn validate_password(password: &str, min_length: usize) -> Result<(), Error> {
    if password.chars().count() < min_length {
        return Err(Error::invalid(format!(
            "password must be at least {min_length} characters"
        )));
    }
    Ok(())
}

/// Offers carry at least one item
pub fn validate_quantity(quantity: u32) -> Result<(), Error> {
    if quantity == 0 {
        return Err(Error::invalid("quantity must be at least 1"));
    }
    Ok(())
}

/// Enforce the configured email domain, if any.
///
/// A mismatch is an authentication failure, not a form error: the account is
/// simply not allowed to use the program.
pub fn check_email_domain(config: &AppConfig, email: &str) -> Result<(), Error> {
    let Some(domain) = &config.allowed_email_domain else {
        return Ok(());
    };

    let email = email.trim().to_lowercase();
    match email.rsplit_once('@') {
        Some((_, actual)) if actual == domain => Ok(()),
        _ => Err(Error::auth(format!("only @{domain} accounts may sign in"))),
    }
}
