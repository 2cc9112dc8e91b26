//! Task types and the template each one is built from.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Kind of generation task a workflow is created for.
///
/// Each variant maps to exactly one template name; templates are looked up
/// by that name in the template store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskType {
    #[serde(rename = "image_generation")]
    ImageGeneration,
    #[serde(rename = "code_generation")]
    CodeGeneration,
    #[serde(rename = "3d_modeling")]
    Modeling3d,
    #[serde(rename = "app_development")]
    AppDevelopment,
    #[serde(rename = "game_development")]
    GameDevelopment,
}

impl TaskType {
    /// Every supported task type, in declaration order.
    pub const ALL: [TaskType; 5] = [
        TaskType::ImageGeneration,
        TaskType::CodeGeneration,
        TaskType::Modeling3d,
        TaskType::AppDevelopment,
        TaskType::GameDevelopment,
    ];

    /// Wire name of the task type (e.g. `image_generation`).
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::ImageGeneration => "image_generation",
            TaskType::CodeGeneration => "code_generation",
            TaskType::Modeling3d => "3d_modeling",
            TaskType::AppDevelopment => "app_development",
            TaskType::GameDevelopment => "game_development",
        }
    }

    /// Name of the template (file stem) this task type is built from.
    pub fn template_name(&self) -> &'static str {
        match self {
            TaskType::ImageGeneration => "image_gen",
            TaskType::CodeGeneration => "code_gen",
            TaskType::Modeling3d => "3d_model",
            TaskType::AppDevelopment => "app_dev",
            TaskType::GameDevelopment => "game_dev",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| CoreError::Validation(format!("Unknown task type: '{s}'")))
    }
}
