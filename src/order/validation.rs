use itertools::Itertools;

use super::DayLabel;
use crate::error::ValidationError;

const MIN_PHONE_DIGITS: usize = 8;
const MAX_PHONE_DIGITS: usize = 15;
const MIN_PASSWORD_LEN: usize = 8;

/// Trims labels and rejects empty, blank or duplicated selections.
/// Duplicates are detected case-insensitively; submission order is kept.
pub fn validate_days(days: &[String]) -> Result<Vec<DayLabel>, ValidationError> {
    if days.is_empty() {
        return Err(ValidationError::EmptyDaySelection);
    }

    let days = days
        .iter()
        .map(|day| day.trim().to_string())
        .collect::<Vec<_>>();

    if days.iter().any(String::is_empty) {
        return Err(ValidationError::BlankDayLabel);
    }

    if let Some(duplicate) = days.iter().duplicates_by(|day| day.to_lowercase()).next() {
        return Err(ValidationError::DuplicateDay(duplicate.clone()));
    }

    Ok(days)
}

pub fn non_blank(value: &str, field: &'static str) -> Result<String, ValidationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(ValidationError::BlankField(field))
    } else {
        Ok(trimmed.to_string())
    }
}

/// Accepts digits separated by spaces or dashes with an optional leading
/// `+`, and returns the compact form (`+` kept, separators dropped).
pub fn normalize_phone_number(raw: &str) -> Result<String, ValidationError> {
    let trimmed = raw.trim();
    let invalid = || ValidationError::InvalidPhoneNumber(raw.to_string());

    let (plus, rest) = trimmed
        .strip_prefix('+')
        .map_or(("", trimmed), |rest| ("+", rest));

    if rest.chars().any(|c| !(c.is_ascii_digit() || c == ' ' || c == '-')) {
        return Err(invalid());
    }

    let digits = rest.chars().filter(char::is_ascii_digit).collect::<String>();
    if !(MIN_PHONE_DIGITS..=MAX_PHONE_DIGITS).contains(&digits.len()) {
        return Err(invalid());
    }

    Ok(format!("{plus}{digits}"))
}

pub fn check_password_policy(password: &str) -> Result<(), ValidationError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ValidationError::PasswordPolicy(
            "must be at least 8 characters long",
        ));
    }
    if !password.chars().any(char::is_alphabetic) {
        return Err(ValidationError::PasswordPolicy("must contain a letter"));
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        return Err(ValidationError::PasswordPolicy("must contain a digit"));
    }
    Ok(())
}
