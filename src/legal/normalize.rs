//! Field normalization shared by every create/update handler.

use std::sync::LazyLock;

use regex::Regex;

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?(?:\.[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?)+$")
        .expect("valid email regex")
});

const MIN_PHONE_DIGITS: usize = 7;
const MAX_PHONE_DIGITS: usize = 20;
const MAX_NAME_LEN: usize = 200;

/// Trim and collapse internal whitespace runs to single spaces.
pub fn collapse_whitespace(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// `None` for missing or blank input, otherwise the trimmed value.
pub fn empty_to_none(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Required display name or title.
pub fn required_text(field: &str, raw: &str) -> Result<String, String> {
    let value = collapse_whitespace(raw);
    if value.is_empty() {
        return Err(format!("{field} is required"));
    }
    if value.chars().count() > MAX_NAME_LEN {
        return Err(format!("{field} must be at most {MAX_NAME_LEN} characters"));
    }
    Ok(value)
}

/// Expects an already lowercased address.
pub fn is_valid_email(email: &str) -> bool {
    email.len() <= 254 && EMAIL_RE.is_match(email)
}

pub fn normalize_email(raw: &str) -> Result<String, String> {
    let email = raw.trim().to_lowercase();
    if email.is_empty() {
        return Err("email is required".to_string());
    }
    if !is_valid_email(&email) {
        return Err(format!("'{}' is not a valid email address", raw.trim()));
    }
    Ok(email)
}

/// Keep digits, `+`, spaces and dashes; require 7 to 20 digits.
pub fn normalize_phone(raw: Option<&str>) -> Result<Option<String>, String> {
    let Some(raw) = empty_to_none(raw) else {
        return Ok(None);
    };
    let kept: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '+' | ' ' | '-'))
        .collect();
    let phone = collapse_whitespace(&kept);
    let digits = phone.chars().filter(char::is_ascii_digit).count();
    if !(MIN_PHONE_DIGITS..=MAX_PHONE_DIGITS).contains(&digits) {
        return Err(format!(
            "phone number must contain between {MIN_PHONE_DIGITS} and {MAX_PHONE_DIGITS} digits"
        ));
    }
    Ok(Some(phone))
}

/// Reference numbers (matter, case, invoice) are stored uppercase without
/// surrounding whitespace.
pub fn normalize_reference(raw: Option<&str>) -> Option<String> {
    empty_to_none(raw).map(|value| collapse_whitespace(&value).to_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_collapses() {
        assert_eq!(collapse_whitespace("  Jane \t  Q.\nDoe "), "Jane Q. Doe");
        assert_eq!(collapse_whitespace("   "), "");
    }

    #[test]
    fn blank_optionals_become_none() {
        assert_eq!(empty_to_none(Some("   ")), None);
        assert_eq!(empty_to_none(None), None);
        assert_eq!(empty_to_none(Some(" x ")), Some("x".to_string()));
    }

    #[test]
    fn required_text_rejects_blank() {
        assert!(required_text("name", " \n ").is_err());
        assert_eq!(required_text("name", " Acme   Corp ").unwrap(), "Acme Corp");
    }

    #[test]
    fn emails_are_lowercased_and_validated() {
        assert_eq!(
            normalize_email("  Jane.Doe@Firm.Example ").unwrap(),
            "jane.doe@firm.example"
        );
        assert!(normalize_email("jane@").is_err());
        assert!(normalize_email("no-at-sign.example").is_err());
        assert!(normalize_email("jane@localhost").is_err());
        assert!(normalize_email("").is_err());
    }

    #[test]
    fn phone_keeps_allowed_characters() {
        assert_eq!(
            normalize_phone(Some(" +1 (555) 010-2030 ")).unwrap(),
            Some("+1 555 010-2030".to_string())
        );
        assert_eq!(normalize_phone(Some("")).unwrap(), None);
        assert!(normalize_phone(Some("12345")).is_err());
        assert!(normalize_phone(Some("1".repeat(21).as_str())).is_err());
    }

    #[test]
    fn references_are_uppercased() {
        assert_eq!(
            normalize_reference(Some(" cv-2024  001 ")),
            Some("CV-2024 001".to_string())
        );
        assert_eq!(normalize_reference(Some(" ")), None);
    }
}
