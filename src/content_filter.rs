use std::sync::LazyLock;

use regex::Regex;

use crate::validation::validate_tax_id;

pub const DEFAULT_BLOCKED_WORDS: &[&str] = &[
    "porra", "merda", "caralho", "puta", "fdp", "vsf", "cu", "buceta", "cacete", "desgraça",
    "inferno",
];

static CARD_CANDIDATE_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\b\d(?:[ \-]?\d){12,18}\b").ok());
static PASSWORD_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:senha|password|pass)\s*[:=]\s*\S+").ok());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensitiveKind {
    Card,
    Password,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensitiveData {
    pub flag: bool,
    pub kind: SensitiveKind,
}

impl SensitiveData {
    fn found(kind: SensitiveKind) -> Self {
        Self { flag: true, kind }
    }

    fn clean() -> Self {
        Self {
            flag: false,
            kind: SensitiveKind::None,
        }
    }
}

/// Classifies inbound text. Holds the compiled block-list.
pub struct ContentFilter {
    profanity: Option<Regex>,
}

impl Default for ContentFilter {
    fn default() -> Self {
        Self::new(&[])
    }
}

impl ContentFilter {
    pub fn new(extra_words: &[String]) -> Self {
        let words = DEFAULT_BLOCKED_WORDS
            .iter()
            .map(|w| w.to_string())
            .chain(extra_words.iter().map(|w| w.trim().to_lowercase()))
            .filter(|w| !w.is_empty())
            .map(|w| regex::escape(&w))
            .collect::<Vec<_>>();
        let profanity = Regex::new(&format!(r"(?i)\b(?:{})\b", words.join("|"))).ok();
        Self { profanity }
    }

    pub fn contains_profanity(&self, text: &str) -> bool {
        self.profanity
            .as_ref()
            .map(|re| re.is_match(text))
            .unwrap_or(false)
    }

    pub fn contains_sensitive_data(&self, text: &str) -> SensitiveData {
        contains_sensitive_data(text)
    }
}

pub fn contains_sensitive_data(text: &str) -> SensitiveData {
    if let Some(re) = CARD_CANDIDATE_RE.as_ref() {
        let has_card = re.find_iter(text).any(|m| looks_like_card(m.as_str()));
        if has_card {
            return SensitiveData::found(SensitiveKind::Card);
        }
    }

    let has_password = PASSWORD_RE
        .as_ref()
        .map(|re| re.is_match(text))
        .unwrap_or(false);
    if has_password {
        return SensitiveData::found(SensitiveKind::Password);
    }

    SensitiveData::clean()
}

fn looks_like_card(candidate: &str) -> bool {
    let digits = candidate
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect::<String>();
    if !(13..=19).contains(&digits.len()) {
        return false;
    }
    // Tax ids and full national phone numbers share the digit-run shape.
    if digits.len() == 14 && validate_tax_id(&digits) {
        return false;
    }
    if digits.len() == 13 && digits.starts_with("55") {
        return false;
    }
    luhn_valid(&digits)
}

fn luhn_valid(digits: &str) -> bool {
    let mut sum = 0u32;
    for (i, c) in digits.chars().rev().enumerate() {
        let Some(mut d) = c.to_digit(10) else {
            return false;
        };
        if i % 2 == 1 {
            d *= 2;
            if d > 9 {
                d -= 9;
            }
        }
        sum += d;
    }
    sum % 10 == 0
}
