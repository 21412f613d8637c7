/// Built-in system prompt: a research paper assistant that searches,
/// summarizes and visualizes papers through the connected tools.
pub const DEFAULT_SYSTEM_PROMPT: &str = include_str!("../../prompts/research_assistant.md");
