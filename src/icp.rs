use serde::Serialize;

use crate::types::{ActivityCode, CompanyRecord};
use crate::validation::digits_only;

/// Business-activity codes accepted as the ideal customer profile.
pub const PERMITTED_ACTIVITY_CODES: &[(&str, &str)] = &[
    ("4744001", "Comércio varejista de ferragens e ferramentas"),
    ("4744099", "Comércio varejista de materiais de construção em geral"),
    ("4672900", "Comércio atacadista de ferragens e ferramentas"),
    ("4742300", "Comércio varejista de material elétrico"),
    ("4679699", "Comércio atacadista de materiais de construção em geral"),
    ("4673700", "Comércio atacadista de material elétrico"),
    (
        "4663000",
        "Comércio atacadista de Máquinas e equipamentos para uso industrial; partes e peças",
    ),
    ("4744003", "Comércio varejista de materiais hidráulicos"),
    (
        "4744005",
        "Comércio varejista de materiais de construção não especificados anteriormente",
    ),
    (
        "4789099",
        "Comércio varejista de outros produtos não especificados anteriormente",
    ),
    (
        "4642702",
        "Comércio atacadista de roupas e acessórios para uso profissional e de segurança do trabalho",
    ),
    ("4755502", "Comércio varejista de artigos de armarinho"),
    ("4679601", "Comércio atacadista de tintas, vernizes e similares"),
    (
        "7739099",
        "Aluguel de outras máquinas e equipamentos comerciais e industriais não especificados anteriormente, sem operador",
    ),
    (
        "4759899",
        "Comércio varejista de outros artigos de uso pessoal e doméstico não especificados anteriormente",
    ),
    ("4741500", "Comércio varejista de tintas e materiais para pintura"),
    (
        "4661300",
        "Comércio atacadista de máquinas, aparelhos e equipamentos para uso agropecuário; partes e peças",
    ),
    (
        "4662100",
        "Comércio atacadista de máquinas, equipamentos para terraplenagem, mineração e construção; partes e peças",
    ),
    (
        "4679604",
        "Comércio atacadista especializado de materiais de construção não especificados anteriormente",
    ),
    (
        "4669999",
        "Comércio atacadista de outras máquinas e equipamentos não especificados anteriormente; partes e peças",
    ),
    ("7319002", "Promoção de vendas"),
    (
        "4613300",
        "Representantes comerciais e agentes do comércio de madeira, material de construção e ferragens",
    ),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchedBy {
    Primary,
    Secondary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IcpVerdict {
    pub qualified: bool,
    pub reason: String,
    pub matched_code: Option<String>,
    pub matched_by: Option<MatchedBy>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PermittedCode {
    pub code: &'static str,
    pub description: &'static str,
}

pub fn permitted_codes() -> Vec<PermittedCode> {
    PERMITTED_ACTIVITY_CODES
        .iter()
        .map(|(code, description)| PermittedCode { code, description })
        .collect()
}

pub fn is_permitted(code: &str) -> bool {
    let normalized = digits_only(code);
    !normalized.is_empty()
        && PERMITTED_ACTIVITY_CODES
            .iter()
            .any(|(permitted, _)| *permitted == normalized)
}

pub fn describe(code: &str) -> Option<&'static str> {
    let normalized = digits_only(code);
    PERMITTED_ACTIVITY_CODES
        .iter()
        .find(|(permitted, _)| *permitted == normalized)
        .map(|(_, description)| *description)
}

/// Primary activity first, then the secondary ones in registry order.
pub fn evaluate(company: &CompanyRecord) -> IcpVerdict {
    if is_permitted(&company.primary_activity.code) {
        return qualified(&company.primary_activity, MatchedBy::Primary);
    }
    if let Some(secondary) = company
        .secondary_activities
        .iter()
        .find(|activity| is_permitted(&activity.code))
    {
        return qualified(secondary, MatchedBy::Secondary);
    }

    IcpVerdict {
        qualified: false,
        reason: format!(
            "CNAE {} ({}) fora do perfil de cliente ideal",
            company.primary_activity.code, company.primary_activity.description
        ),
        matched_code: None,
        matched_by: None,
    }
}

fn qualified(activity: &ActivityCode, matched_by: MatchedBy) -> IcpVerdict {
    let label = match matched_by {
        MatchedBy::Primary => "principal",
        MatchedBy::Secondary => "secundário",
    };
    IcpVerdict {
        qualified: true,
        reason: format!(
            "CNAE {label} {} ({}) aprovado",
            activity.code, activity.description
        ),
        matched_code: Some(digits_only(&activity.code)),
        matched_by: Some(matched_by),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Address;

    fn company(primary: &str, secondary: &[&str]) -> CompanyRecord {
        CompanyRecord {
            tax_id: "08054886000168".into(),
            formatted_tax_id: "08.054.886/0001-68".into(),
            legal_name: "Casa das Serras LTDA".into(),
            trade_name: "Casa das Serras".into(),
            registration_status: "ATIVA".into(),
            opened_on: "2010-03-01".into(),
            primary_activity: ActivityCode {
                code: primary.into(),
                description: "primária".into(),
            },
            secondary_activities: secondary
                .iter()
                .map(|code| ActivityCode {
                    code: code.to_string(),
                    description: "secundária".into(),
                })
                .collect(),
            address: Address::default(),
            phone: String::new(),
            email: String::new(),
            share_capital: None,
            company_size: None,
            legal_nature: String::new(),
        }
    }

    #[test]
    fn list_has_twenty_two_codes() {
        assert_eq!(PERMITTED_ACTIVITY_CODES.len(), 22);
        assert_eq!(describe("4744-0/01"), Some("Comércio varejista de ferragens e ferramentas"));
    }

    #[test]
    fn primary_code_qualifies_with_punctuation() {
        let verdict = evaluate(&company("47.44-0-01", &[]));
        assert!(verdict.qualified);
        assert_eq!(verdict.matched_by, Some(MatchedBy::Primary));
        assert_eq!(verdict.matched_code.as_deref(), Some("4744001"));
    }

    #[test]
    fn secondary_code_qualifies_when_primary_does_not() {
        let verdict = evaluate(&company("5611201", &["1091101", "4672900"]));
        assert!(verdict.qualified);
        assert_eq!(verdict.matched_by, Some(MatchedBy::Secondary));
        assert_eq!(verdict.matched_code.as_deref(), Some("4672900"));
    }

    #[test]
    fn unrelated_activity_is_rejected() {
        let verdict = evaluate(&company("5611201", &["1091101"]));
        assert!(!verdict.qualified);
        assert!(verdict.reason.contains("5611201"));
        assert!(!is_permitted(""));
    }
}
