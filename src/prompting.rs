use minijinja::{context, Environment};

use crate::types::LeadFields;

const SYSTEM_PROMPT_TEMPLATE: &str = include_str!("prompts/system_prompt.j2");

pub const AGENT_NAME: &str = "Márcia";
pub const COMPANY_NAME: &str = "Maxi Force Ferramentas Diamantadas";

pub const INVALID_TAX_ID_NOTE: &str = "O usuário informou um CNPJ inválido (dígitos verificadores não conferem). \
Não aceite esse CNPJ e peça gentilmente que ele confira e envie novamente.";

pub struct SystemPromptContext<'a> {
    pub agent_name: &'a str,
    pub company_name: &'a str,
    pub known_memory: &'a LeadFields,
    pub knowledge: &'a str,
}

impl<'a> SystemPromptContext<'a> {
    pub fn new(known_memory: &'a LeadFields, knowledge: &'a str) -> Self {
        Self {
            agent_name: AGENT_NAME,
            company_name: COMPANY_NAME,
            known_memory,
            knowledge,
        }
    }
}

fn known_memory_json(memory: &LeadFields) -> String {
    if memory.is_empty() {
        return String::new();
    }
    serde_json::to_string_pretty(memory).unwrap_or_default()
}

pub fn render_system_prompt(ctx: &SystemPromptContext<'_>) -> String {
    let mut env = Environment::new();
    if env
        .add_template("system_prompt", SYSTEM_PROMPT_TEMPLATE)
        .is_err()
    {
        return fallback_system_prompt(ctx);
    }

    let Ok(template) = env.get_template("system_prompt") else {
        return fallback_system_prompt(ctx);
    };

    let known_memory = known_memory_json(ctx.known_memory);
    template
        .render(context! {
            agent_name => ctx.agent_name,
            company_name => ctx.company_name,
            known_memory => known_memory,
            has_memory => !known_memory.is_empty(),
            knowledge => ctx.knowledge.trim(),
            has_knowledge => !ctx.knowledge.trim().is_empty(),
        })
        .unwrap_or_else(|_| fallback_system_prompt(ctx))
}

fn fallback_system_prompt(ctx: &SystemPromptContext<'_>) -> String {
    let mut prompt = format!(
        "Você é {}, SDR da {}. Colete CNPJ, nome, telefone, e-mail, origem, produto de interesse e prazo.\n\
         Nunca repita perguntas já respondidas. Não fale de preços.\n\
         Quando tiver CNPJ, nome e telefone, inclua um objeto JSON com os dados no final.\n",
        ctx.agent_name, ctx.company_name
    );

    let known_memory = known_memory_json(ctx.known_memory);
    if !known_memory.is_empty() {
        prompt.push_str("\nDados já conhecidos:\n");
        prompt.push_str(&known_memory);
        prompt.push('\n');
    }

    if !ctx.knowledge.trim().is_empty() {
        prompt.push_str("\nCatálogo:\n");
        prompt.push_str(ctx.knowledge.trim());
        prompt.push('\n');
    }

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_memory_is_rendered_for_the_model() {
        let memory = LeadFields {
            tax_id: Some("08054886000168".into()),
            name: Some("Ana".into()),
            ..Default::default()
        };
        let prompt = render_system_prompt(&SystemPromptContext::new(&memory, ""));
        assert!(prompt.contains("08054886000168"));
        assert!(prompt.contains("não pergunte de novo"));
        assert!(!prompt.contains("Catálogo (use"));
    }

    #[test]
    fn knowledge_excerpt_is_included_when_present() {
        let memory = LeadFields::default();
        let prompt = render_system_prompt(&SystemPromptContext::new(&memory, "Disco Turbo 110mm"));
        assert!(prompt.contains("Disco Turbo 110mm"));
        assert!(prompt.contains("Ainda não sabemos nada"));
    }
}
