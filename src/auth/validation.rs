//! Request validation. Every check runs and all failures are reported together,
//! before anything touches storage.

use lazy_static::lazy_static;
use regex::Regex;

use crate::auth::dto::{EmailRequest, LoginRequest, RegisterRequest};
use crate::auth::error::AuthError;
use crate::auth::repo_types::Role;

pub const PASSWORD_SYMBOLS: &str = "@$!%*?&";
const MAX_LEN: usize = 255;
const MIN_PASSWORD_LEN: usize = 8;

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

/// Two ASCII-alphabetic words with a single space between them.
// NOTE: rejects hyphens, middle names and non-Latin scripts; kept as the product rule.
pub(crate) fn is_valid_full_name(name: &str) -> bool {
    lazy_static! {
        static ref NAME_RE: Regex = Regex::new(r"^[a-zA-Z]+ [a-zA-Z]+$").unwrap();
    }
    NAME_RE.is_match(name)
}

/// Lowercase, uppercase, digit and one of `@$!%*?&`, nothing outside that alphabet.
pub(crate) fn is_strong_password(password: &str) -> bool {
    let allowed = password
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || PASSWORD_SYMBOLS.contains(c));
    allowed
        && password.chars().any(|c| c.is_ascii_lowercase())
        && password.chars().any(|c| c.is_ascii_uppercase())
        && password.chars().any(|c| c.is_ascii_digit())
        && password.chars().any(|c| PASSWORD_SYMBOLS.contains(c))
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

fn check_email(value: &Option<String>, errors: &mut Vec<String>) -> Option<String> {
    let Some(raw) = present(value) else {
        errors.push("The email field is required.".into());
        return None;
    };
    let email = normalize_email(raw);
    if email.chars().count() > MAX_LEN {
        errors.push("The email field must not be greater than 255 characters.".into());
        return None;
    }
    if !is_valid_email(&email) {
        errors.push("The email field must be a valid email address.".into());
        return None;
    }
    Some(email)
}

#[derive(Debug, Clone)]
pub struct ValidRegistration {
    pub name: String,
    pub email: String,
    pub password: String,
    pub role: Role,
}

pub fn validate_registration(req: RegisterRequest) -> Result<ValidRegistration, AuthError> {
    let mut errors = Vec::new();

    let name = match present(&req.name).map(str::trim) {
        None => {
            errors.push("The name field is required.".into());
            None
        }
        Some(n) if n.chars().count() > MAX_LEN => {
            errors.push("The name field must not be greater than 255 characters.".into());
            None
        }
        Some(n) if !is_valid_full_name(n) => {
            errors.push(
                "The name must contain only alphabets with one space between first and last name."
                    .into(),
            );
            None
        }
        Some(n) => Some(n.to_string()),
    };

    let email = check_email(&req.email, &mut errors);

    let password = match req.password.as_deref().filter(|p| !p.is_empty()) {
        None => {
            errors.push("The password field is required.".into());
            None
        }
        Some(p) => {
            let mut ok = true;
            if p.chars().count() < MIN_PASSWORD_LEN {
                errors.push("The password field must be at least 8 characters.".into());
                ok = false;
            }
            if !is_strong_password(p) {
                errors.push(
                    "The password must contain at least one uppercase letter, one lowercase letter, one number, and one special character."
                        .into(),
                );
                ok = false;
            }
            ok.then(|| p.to_string())
        }
    };

    match req.password_confirmation.as_deref().filter(|p| !p.is_empty()) {
        None => errors.push("The password confirmation field is required.".into()),
        Some(c) if Some(c) != req.password.as_deref() => {
            errors.push("The password confirmation field must match password.".into())
        }
        Some(_) => {}
    }

    let role = match present(&req.role) {
        None => {
            errors.push("The role field is required.".into());
            None
        }
        Some(r) => {
            let role = Role::parse(r.trim());
            if role.is_none() {
                errors.push("The role must be either \"applicant\" or \"company\".".into());
            }
            role
        }
    };

    match (name, email, password, role) {
        (Some(name), Some(email), Some(password), Some(role)) if errors.is_empty() => {
            Ok(ValidRegistration {
                name,
                email,
                password,
                role,
            })
        }
        _ => Err(AuthError::Validation(errors)),
    }
}

/// Returns the normalized email and the password as given.
pub fn validate_login(req: LoginRequest) -> Result<(String, String), AuthError> {
    let mut errors = Vec::new();
    let email = check_email(&req.email, &mut errors);
    let password = req.password.filter(|p| !p.is_empty());
    if password.is_none() {
        errors.push("The password field is required.".into());
    }
    match (email, password) {
        (Some(email), Some(password)) => Ok((email, password)),
        _ => Err(AuthError::Validation(errors)),
    }
}

pub fn validate_email_request(req: EmailRequest) -> Result<String, AuthError> {
    let mut errors = Vec::new();
    check_email(&req.email, &mut errors).ok_or(AuthError::Validation(errors))
}
