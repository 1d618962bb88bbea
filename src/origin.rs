use std::sync::LazyLock;

use regex::Regex;

struct OriginRule {
    label: &'static str,
    pattern: Option<Regex>,
}

static ORIGIN_RULES: LazyLock<Vec<OriginRule>> = LazyLock::new(|| {
    let rule = |label, pattern: &str| OriginRule {
        label,
        pattern: Regex::new(pattern).ok(),
    };
    vec![
        rule(
            "Instagram",
            r"(?i)\b(?:insta|instagram|ig|anuncio|anúncio|propaganda|post|story|stories|rede social|redes sociais)\b",
        ),
        rule(
            "Site",
            r"(?i)\b(?:site|google|pesquisa|busca|navegador|internet|web)\b",
        ),
        rule(
            "Indicação",
            r"(?i)\b(?:indicacao|indicação|indicaram|indicou|amigo|amiga|conhecido|parceiro|recomendacao|recomendação)\b",
        ),
        // Only when the lead names the channel; never inferred from the transport.
        rule("WhatsApp", r"(?i)\b(?:whatsapp|whats|wpp|zap)\b"),
    ]
});

/// Maps free-text answers to "how did you hear about us" onto canonical labels.
pub fn normalize_origin(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    for rule in ORIGIN_RULES.iter() {
        let matched = rule
            .pattern
            .as_ref()
            .map(|re| re.is_match(trimmed))
            .unwrap_or(false);
        if matched {
            return rule.label.to_string();
        }
    }

    title_case(trimmed)
}

fn title_case(value: &str) -> String {
    value
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(char::to_lowercase))
                    .collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
