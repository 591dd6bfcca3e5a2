//! Phone number validation.
//!
//! Outbound dialing and agent phone assignment both use E.164 form. The
//! number is validated after stripping whitespace; a leading `+` is
//! preserved when present and added when absent.

use once_cell::sync::Lazy;
use regex::Regex;

static E164: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\+?[1-9]\d{9,14}$").expect("static E.164 pattern")
});

/// Validate and normalize a phone number to E.164.
///
/// Returns the normalized `+`-prefixed number, or `None` when the input is
/// not a plausible E.164 number.
pub fn normalize_phone_number(raw: &str) -> Option<String> {
    let stripped: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if !E164.is_match(&stripped) {
        return None;
    }
    if stripped.starts_with('+') {
        Some(stripped)
    } else {
        Some(format!("+{stripped}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_numbers() {
        assert_eq!(
            normalize_phone_number("+919876543210").as_deref(),
            Some("+919876543210")
        );
        assert_eq!(
            normalize_phone_number("919876543210").as_deref(),
            Some("+919876543210")
        );
        assert_eq!(
            normalize_phone_number("+1 415 555 1212").as_deref(),
            Some("+14155551212")
        );
    }

    #[test]
    fn rejects_invalid_numbers() {
        assert!(normalize_phone_number("0123456789").is_none()); // leading zero
        assert!(normalize_phone_number("+12345").is_none()); // too short
        assert!(normalize_phone_number("+1234567890123456").is_none()); // too long
        assert!(normalize_phone_number("call-me").is_none());
        assert!(normalize_phone_number("").is_none());
    }
}
