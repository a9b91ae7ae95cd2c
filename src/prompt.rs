//! Per-family prompt templates, selected by model name.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptStyle {
    /// `User: ...\nBot:` for DialoGPT checkpoints.
    Dialogue,
    /// Zephyr-style `<|user|>` / `<|assistant|>` turns.
    ChatTurns,
    /// `Question: ...\nAnswer:` for plain GPT-2 style models.
    QuestionAnswer,
}

type Matcher = fn(&str) -> bool;

/// Evaluated top to bottom; the first matching entry wins.
const TEMPLATE_TABLE: &[(Matcher, PromptStyle)] = &[
    (is_dialogpt, PromptStyle::Dialogue),
    (is_chat_tuned, PromptStyle::ChatTurns),
];

fn is_dialogpt(name: &str) -> bool {
    name.contains("DialoGPT")
}

fn is_chat_tuned(name: &str) -> bool {
    name.contains("TinyLlama") || name.to_lowercase().contains("chat")
}

impl PromptStyle {
    pub fn for_model(model_name: &str) -> Self {
        TEMPLATE_TABLE
            .iter()
            .find(|(matches, _)| matches(model_name))
            .map(|(_, style)| *style)
            .unwrap_or(PromptStyle::QuestionAnswer)
    }

    pub fn render(self, prompt: &str) -> String {
        match self {
            PromptStyle::Dialogue => format!("User: {prompt}\nBot:"),
            PromptStyle::ChatTurns => format!("<|user|>\n{prompt}\n<|assistant|>\n"),
            PromptStyle::QuestionAnswer => format!("Question: {prompt}\nAnswer:"),
        }
    }
}

pub fn format_prompt(model_name: &str, prompt: &str) -> String {
    PromptStyle::for_model(model_name).render(prompt)
}
