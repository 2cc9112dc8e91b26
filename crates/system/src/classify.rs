//! Keyword-based task type inference for free-text requests.
//!
//! A request matches a task type when it contains an action verb followed
//! (anywhere later) by a noun for that kind of artifact, e.g. "create a game"
//! or "gerar uma imagem". Patterns are checked in order; the first match wins,
//! so "build an app for my game studio" is an app, not a game.

use std::sync::LazyLock;

use regex::Regex;
use studio_core::task::TaskType;

static PATTERNS: LazyLock<Vec<(TaskType, Regex)>> = LazyLock::new(|| {
    [
        (
            TaskType::AppDevelopment,
            r"(?i)\b(create|build|develop|make|criar|desenvolver|fazer)\b.*\b(app|application|aplicativo|aplicação|system|sistema)\b",
        ),
        (
            TaskType::GameDevelopment,
            r"(?i)\b(create|build|develop|make|criar|desenvolver|fazer)\b.*\b(game|jogo)\b",
        ),
        (
            TaskType::ImageGeneration,
            r"(?i)\b(create|generate|draw|make|paint|criar|gerar|fazer)\b.*\b(image|picture|art|drawing|illustration|imagem|figura|arte|desenho)\b",
        ),
        (
            TaskType::Modeling3d,
            r"(?i)\b(create|generate|model|sculpt|criar|gerar|modelar)\b.*\b(3d|model|character|modelo|personagem)\b",
        ),
        (
            TaskType::CodeGeneration,
            r"(?i)\b(write|generate|create|implement|escrever|gerar|criar)\b.*\b(code|function|script|program|código|função|programa)\b",
        ),
    ]
    .into_iter()
    .map(|(task_type, pattern)| (task_type, Regex::new(pattern).expect("valid regex")))
    .collect()
});

/// Infer the generation task a message asks for, if any.
pub fn infer_task_type(message: &str) -> Option<TaskType> {
    PATTERNS
        .iter()
        .find(|(_, re)| re.is_match(message))
        .map(|(task_type, _)| *task_type)
}
