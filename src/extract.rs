use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::types::LeadFields;
use crate::validation::{digits_only, validate_tax_id};

/// Which strategy produced an extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionSource {
    JsonBlock,
    CompleteMarker,
    DataBlock,
    LabelledLines,
    Nothing,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub fields: LeadFields,
    pub source: ExtractionSource,
    pub confirmed: bool,
    pub ready: bool,
}

/// Output of a single strategy before the detectors run.
#[derive(Debug, Clone, Default)]
struct ParsedBlock {
    fields: LeadFields,
    ready: bool,
    confirmed: bool,
}

impl ParsedBlock {
    fn is_empty(&self) -> bool {
        self.fields.is_empty() && !self.ready && !self.confirmed
    }
}

trait FieldParser: Sync {
    fn source(&self) -> ExtractionSource;
    fn parse(&self, text: &str) -> Option<ParsedBlock>;
}

struct JsonBlockParser;
struct CompleteMarkerParser;
struct DataBlockParser;
struct LabelledLineParser;

static PARSERS: [&dyn FieldParser; 4] = [
    &JsonBlockParser,
    &CompleteMarkerParser,
    &DataBlockParser,
    &LabelledLineParser,
];

static COMPLETE_MARKER_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?s)\[COMPLETE\]\s*(\{.*?\})").ok());
static DATA_BLOCK_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?s)\[DATA\](.*?)\[/DATA\]").ok());
static CONFIRMATION_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:sim|correto|correta|certo|certinho|ok|okay|confirmo|confirmado|confirmar|isso|exato|perfeito|yes|correct|confirm)\b",
    )
    .ok()
});
static TAX_ID_CANDIDATE_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\b(?:\d[./\-]?){10,13}\d\b").ok());
static EMAIL_CANDIDATE_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}").ok()
});
static FILLER_PREFIX_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:do\s+contato|da\s+empresa|de\s+compra|do\s+respons[aá]vel)\s*:\s*").ok()
});

struct LabelledPattern {
    key: &'static str,
    pattern: Option<Regex>,
}

static LABELLED_PATTERNS: LazyLock<Vec<LabelledPattern>> = LazyLock::new(|| {
    // `Label[ qualifier]: value`, tolerating markdown emphasis around label and value.
    let labelled = |key, labels: &str, value: &str| LabelledPattern {
        key,
        pattern: Regex::new(&format!(
            r"(?im)\b(?:{labels})(?:\s+(?:do|da|de|dos|das)\s+[\p{{L}}]+)?\**\s*:\s*\**\s*({value})"
        ))
        .ok(),
    };
    vec![
        labelled("cnpj", "cnpj", r"[0-9][0-9./\-\s]{12,20}[0-9]"),
        labelled("name", "nome|empresa|respons[aá]vel", r"[^\n*]+"),
        labelled("phone", "telefone|whatsapp|celular|fone", r"[0-9+()][0-9\s\-()+]{7,}[0-9]"),
        labelled("email", "e-?mail", r"[^\s*]+@[^\s*]+"),
        labelled("origin", "origem", r"[^\n*]+"),
        labelled("source", "fonte", r"[^\n*]+"),
        labelled("campaign", "campanha", r"[^\n*]+"),
        labelled("product", "interesse|produtos?", r"[^\n*]+"),
        labelled("quantity", "quantidade", r"[0-9]+"),
        labelled("prazo", "prazo", r"[^\n*]+"),
    ]
});

/// Layered extraction: the first strategy that yields anything wins.
pub fn extract_structured(text: &str) -> Extraction {
    for parser in PARSERS.iter() {
        let Some(block) = parser.parse(text) else {
            continue;
        };
        if block.is_empty() {
            continue;
        }
        let ready = block.ready || is_ready(&block.fields);
        let confirmed = block.confirmed || is_confirmation(text);
        return Extraction {
            fields: block.fields,
            source: parser.source(),
            confirmed,
            ready,
        };
    }

    Extraction {
        fields: LeadFields::default(),
        source: ExtractionSource::Nothing,
        confirmed: is_confirmation(text),
        ready: false,
    }
}

/// Tax id submitted in free text, punctuation allowed.
///
/// A run that passes the checksum wins, then any 14-digit run. A shorter run
/// of 11 to 13 digits only counts when the text mentions "cnpj", so a phone
/// number next to the tax id is never picked over it.
pub fn extract_tax_id(text: &str) -> Option<String> {
    let re = TAX_ID_CANDIDATE_RE.as_ref()?;
    let candidates = re
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .filter(|candidate| (11..=14).contains(&digits_only(candidate).len()))
        .collect::<Vec<_>>();

    if let Some(valid) = candidates
        .iter()
        .find(|candidate| validate_tax_id(&digits_only(candidate)))
    {
        return Some(valid.clone());
    }
    if let Some(full) = candidates
        .iter()
        .find(|candidate| digits_only(candidate).len() == 14)
    {
        return Some(full.clone());
    }
    if text.to_lowercase().contains("cnpj") {
        return candidates.into_iter().next();
    }
    None
}

pub fn extract_email(text: &str) -> Option<String> {
    let re = EMAIL_CANDIDATE_RE.as_ref()?;
    re.find(text)
        .map(|m| m.as_str().trim_end_matches('.').to_string())
}

pub fn is_confirmation(text: &str) -> bool {
    CONFIRMATION_RE
        .as_ref()
        .map(|re| re.is_match(text))
        .unwrap_or(false)
}

pub fn is_ready(fields: &LeadFields) -> bool {
    fields.tax_id.is_some() && fields.name.is_some() && fields.phone.is_some()
}

impl FieldParser for JsonBlockParser {
    fn source(&self) -> ExtractionSource {
        ExtractionSource::JsonBlock
    }

    fn parse(&self, text: &str) -> Option<ParsedBlock> {
        let start = text.find('{')?;
        let end = text.rfind('}')?;
        if end <= start {
            return None;
        }
        parse_json_object(&text[start..=end])
    }
}

impl FieldParser for CompleteMarkerParser {
    fn source(&self) -> ExtractionSource {
        ExtractionSource::CompleteMarker
    }

    fn parse(&self, text: &str) -> Option<ParsedBlock> {
        let re = COMPLETE_MARKER_RE.as_ref()?;
        let caps = re.captures(text)?;
        let mut block = parse_json_object(caps.get(1)?.as_str())?;
        block.ready = true;
        Some(block)
    }
}

impl FieldParser for DataBlockParser {
    fn source(&self) -> ExtractionSource {
        ExtractionSource::DataBlock
    }

    fn parse(&self, text: &str) -> Option<ParsedBlock> {
        let re = DATA_BLOCK_RE.as_ref()?;
        let body = re.captures(text)?.get(1)?.as_str().to_string();
        let mut fields = LeadFields::default();
        for line in body.lines() {
            let Some((label, value)) = line.split_once(':') else {
                continue;
            };
            let value = clean_value(value);
            if value.is_empty() {
                continue;
            }
            fields.set(&canonical_key(label), value);
        }
        Some(ParsedBlock {
            fields,
            ..Default::default()
        })
    }
}

impl FieldParser for LabelledLineParser {
    fn source(&self) -> ExtractionSource {
        ExtractionSource::LabelledLines
    }

    fn parse(&self, text: &str) -> Option<ParsedBlock> {
        let mut fields = LeadFields::default();
        for entry in LABELLED_PATTERNS.iter() {
            let Some(re) = entry.pattern.as_ref() else {
                continue;
            };
            let Some(value) = re
                .captures(text)
                .and_then(|caps| caps.get(1))
                .map(|m| clean_value(m.as_str()))
            else {
                continue;
            };
            if value.is_empty() {
                continue;
            }
            fields.set(entry.key, value);
        }
        Some(ParsedBlock {
            fields,
            ..Default::default()
        })
    }
}

fn parse_json_object(candidate: &str) -> Option<ParsedBlock> {
    let parsed = serde_json::from_str::<Value>(candidate.trim()).ok()?;
    let object = parsed.as_object()?;
    Some(block_from_object(object))
}

fn block_from_object(object: &Map<String, Value>) -> ParsedBlock {
    let mut block = ParsedBlock::default();
    for (key, value) in object {
        let key = canonical_key(key);
        match (key.as_str(), value) {
            ("ready", Value::Bool(flag)) => block.ready = *flag,
            ("confirmed", Value::Bool(flag)) => block.confirmed = *flag,
            (_, Value::Null) => {}
            (_, Value::String(text)) => {
                let cleaned = clean_value(text);
                if !cleaned.is_empty() {
                    block.fields.set(&key, cleaned);
                }
            }
            (_, Value::Number(number)) => block.fields.set(&key, number.to_string()),
            (_, other) => {
                block.fields.extras.insert(key.clone(), other.clone());
            }
        }
    }
    block
}

fn canonical_key(label: &str) -> String {
    let lower = label
        .trim()
        .trim_matches(|c: char| c == '*' || c == '_' || c == '-' || c == '•')
        .trim()
        .to_lowercase();
    let mapped = match lower.as_str() {
        "cnpj" | "tax_id" | "taxid" => "cnpj",
        "nome" | "name" | "empresa" | "responsavel" | "responsável" | "nome do contato" => "name",
        "telefone" | "phone" | "whatsapp" | "celular" => "phone",
        "email" | "e-mail" => "email",
        "origem" | "origin" => "origin",
        "fonte" | "source" => "source",
        "campanha" | "campaign" => "campaign",
        "produto" | "produtos" | "interesse" | "product" => "product",
        "quantidade" | "quantity" => "quantity",
        "prazo" | "prazo de compra" | "deadline" => "prazo",
        "pronto" | "ready" => "ready",
        "confirmado" | "confirmed" => "confirmed",
        other => other,
    };
    mapped.to_string()
}

fn clean_value(raw: &str) -> String {
    let stripped = raw
        .replace("**", "")
        .replace("__", "")
        .trim()
        .trim_matches(|c: char| c == '*' || c == '_' || c == '`')
        .trim()
        .to_string();
    match FILLER_PREFIX_RE.as_ref() {
        Some(re) => re.replace(&stripped, "").trim().to_string(),
        None => stripped,
    }
}

static CONTROL_TAG_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?s)\[DATA\].*?\[/DATA\]",
        r"(?s)\[COMPLETE\]\s*(?:\{.*?\})?",
        r"\[SEND_CATALOG\]",
        r"(?s)```(?:json)?\s*\{.*?\}\s*```",
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});
static BLANK_RUN_RE: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"\n{3,}").ok());

/// Reply text with internal control tags removed, plus whether a catalog send was requested.
pub fn strip_control_tags(reply: &str) -> (String, bool) {
    let send_catalog = reply.contains("[SEND_CATALOG]");
    let mut text = reply.to_string();
    for re in CONTROL_TAG_RES.iter() {
        text = re.replace_all(&text, "").to_string();
    }

    // A trailing bare JSON object is system-facing data.
    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        let trailing_only = text[end + 1..].trim().is_empty();
        if end > start
            && trailing_only
            && serde_json::from_str::<Value>(&text[start..=end])
                .map(|v| v.is_object())
                .unwrap_or(false)
        {
            text.truncate(start);
        }
    }

    let text = match BLANK_RUN_RE.as_ref() {
        Some(re) => re.replace_all(&text, "\n\n").to_string(),
        None => text,
    };
    (text.trim().to_string(), send_catalog)
}
