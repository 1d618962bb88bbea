use std::sync::LazyLock;

use regex::Regex;

static EMAIL_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").ok());

pub fn digits_only(value: &str) -> String {
    value.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Contact id for a phone number: digits only, with the `55` country code
/// prefixed to 10/11-digit national numbers. `None` when no digits remain.
pub fn contact_id_for_phone(raw: &str) -> Option<String> {
    let digits = digits_only(raw);
    match digits.len() {
        0 => None,
        10 | 11 => Some(format!("55{digits}")),
        _ => Some(digits),
    }
}

/// Two-check-digit registry id validation (weighted modulo 11).
pub fn validate_tax_id(candidate: &str) -> bool {
    let digits = digits_only(candidate)
        .chars()
        .filter_map(|c| c.to_digit(10))
        .collect::<Vec<_>>();
    if digits.len() != 14 {
        return false;
    }
    if digits.iter().all(|d| *d == digits[0]) {
        return false;
    }

    let first = check_digit(&digits[..12]);
    if digits[12] != first {
        return false;
    }
    let second = check_digit(&digits[..13]);
    digits[13] == second
}

fn check_digit(body: &[u32]) -> u32 {
    let sum = body
        .iter()
        .rev()
        .enumerate()
        .map(|(i, d)| d * (2 + (i as u32 % 8)))
        .sum::<u32>();
    let remainder = sum % 11;
    if remainder < 2 {
        0
    } else {
        11 - remainder
    }
}

pub fn validate_email(candidate: &str) -> bool {
    EMAIL_RE
        .as_ref()
        .map(|re| re.is_match(candidate.trim()))
        .unwrap_or(false)
}

/// Display form for 10/11/13-digit national numbers; anything else is returned as given.
pub fn format_phone(raw: &str) -> String {
    let digits = digits_only(raw);
    match digits.len() {
        13 => format!(
            "+{} ({}) {}-{}",
            &digits[0..2],
            &digits[2..4],
            &digits[4..9],
            &digits[9..13]
        ),
        11 => format!("({}) {}-{}", &digits[0..2], &digits[2..7], &digits[7..11]),
        10 => format!("({}) {}-{}", &digits[0..2], &digits[2..6], &digits[6..10]),
        _ => raw.to_string(),
    }
}

/// `00.000.000/0000-00`; non-14-digit input is returned as given.
pub fn format_tax_id(raw: &str) -> String {
    let digits = digits_only(raw);
    if digits.len() != 14 {
        return raw.to_string();
    }
    format!(
        "{}.{}.{}/{}-{}",
        &digits[0..2],
        &digits[2..5],
        &digits[5..8],
        &digits[8..12],
        &digits[12..14]
    )
}
