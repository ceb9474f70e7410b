use minijinja::{context, Environment};

use crate::types::{RelevanceTag, StepId};

const SYSTEM_PROMPT_TEMPLATE: &str = include_str!("prompts/lead_qualification.j2");

/// Assistant turn injected before the user's reply when a stored session is resumed.
pub const RESUME_SESSION_PROMPT: &str =
    "We found an existing session. Would you like to continue where you left off?";

pub struct SystemPromptContext<'a> {
    pub demo_booking_url: &'a str,
}

/// Closing message the model must send for hot leads.
pub fn final_demo_message(demo_booking_url: &str) -> String {
    format!(
        "We're excited about the potential opportunity to work together! Based on your \
         requirements, we'd love to schedule a personalized demo right away. Please pick a \
         time that works best for you here: {demo_booking_url}"
    )
}

pub fn render_system_prompt(ctx: &SystemPromptContext<'_>) -> String {
    let mut env = Environment::new();
    if env
        .add_template("lead_qualification", SYSTEM_PROMPT_TEMPLATE)
        .is_err()
    {
        return fallback_system_prompt(ctx);
    }

    let Ok(template) = env.get_template("lead_qualification") else {
        return fallback_system_prompt(ctx);
    };

    template
        .render(context! {
            relevance_tags => RelevanceTag::ALL.iter().map(|tag| tag.as_str()).collect::<Vec<_>>(),
            steps => StepId::ALL.iter().map(|step| step.as_str()).collect::<Vec<_>>(),
            final_message => final_demo_message(ctx.demo_booking_url),
        })
        .map(|prompt| prompt.trim().to_string())
        .unwrap_or_else(|_| fallback_system_prompt(ctx))
}

fn fallback_system_prompt(ctx: &SystemPromptContext<'_>) -> String {
    format!(
        "You are a Lead Qualification Assistant. Collect the lead's email, companyName and \
         companyInfo, then classify relevanceTag as one of \"Not relevant\", \"Weak lead\", \
         \"Hot lead\" or \"Very big potential customer\".\n\
         Reply with a single JSON object with the keys step_id (\"email\", \"companyName\", \
         \"companyInfo\" or \"done\"), lead (email, companyName, companyInfo, relevanceTag; \
         missing values are empty strings) and botMessage.\n\
         When step_id is \"done\" and the lead is hot, botMessage must be exactly: \"{}\"",
        final_demo_message(ctx.demo_booking_url)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendered_prompt_lists_contract_values_and_link() {
        let prompt = render_system_prompt(&SystemPromptContext {
            demo_booking_url: "https://book.example.com/demo",
        });
        assert!(prompt.starts_with("You are a Lead Qualification Assistant."));
        assert!(prompt.contains("\"Very big potential customer\""));
        assert!(prompt.contains("\"companyInfo\", \"done\""));
        assert!(prompt.contains(&final_demo_message("https://book.example.com/demo")));
        assert!(!prompt.contains("{{"));
    }

    #[test]
    fn fallback_prompt_keeps_the_link() {
        let prompt = fallback_system_prompt(&SystemPromptContext {
            demo_booking_url: "https://x.test",
        });
        assert!(prompt.contains("here: https://x.test"));
    }
}
