use minijinja::{context, Environment};

use crate::types::{ChatMessage, Platform};

const SYSTEM_PROMPT_TEMPLATE: &str = include_str!("prompts/system_prompt.j2");

pub struct SystemPromptContext<'a> {
    pub business_name: &'a str,
    pub bot_persona: &'a str,
    pub channel: Platform,
    pub transcript: &'a str,
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

    template
        .render(context! {
            business_name => ctx.business_name.trim(),
            bot_persona => ctx.bot_persona.trim(),
            channel => ctx.channel.as_str(),
            transcript => ctx.transcript.trim(),
        })
        .map(|rendered| rendered.trim().to_string())
        .unwrap_or_else(|_| fallback_system_prompt(ctx))
}

fn fallback_system_prompt(ctx: &SystemPromptContext<'_>) -> String {
    let mut prompt = format!(
        "You are a helpful assistant for {}.\n",
        if ctx.business_name.trim().is_empty() {
            "a business"
        } else {
            ctx.business_name.trim()
        }
    );

    if !ctx.bot_persona.trim().is_empty() {
        prompt.push_str("\nPersona:\n");
        prompt.push_str(ctx.bot_persona.trim());
        prompt.push('\n');
    }

    if !ctx.transcript.trim().is_empty() {
        prompt.push_str("\nRecent conversation:\n");
        prompt.push_str(ctx.transcript.trim());
        prompt.push('\n');
    }

    prompt
}

/// One `role: content` line per message, oldest first.
pub fn render_transcript(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|message| format!("{}: {}", message.role.as_str(), message.content))
        .collect::<Vec<_>>()
        .join("\n")
}
