//! Line-oriented command console for the `studio` binary.
//!
//! Each input line is one command; each response is one JSON line.
//!
//! | Input                         | Action                              |
//! |-------------------------------|-------------------------------------|
//! | `status <task_id>`            | [`SystemManager::get_task_status`]  |
//! | `stop <task_id>`              | [`SystemManager::stop_task`]        |
//! | `list`                        | [`SystemManager::list_tasks`]       |
//! | `system`                      | [`SystemManager::status`]           |
//! | `quit` / `exit`               | end the session                     |
//! | `<task_type>: <message>`      | request with an explicit task type  |
//! | anything else                 | request, task type inferred         |

use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use studio_core::task::TaskType;
use studio_core::types::WorkflowId;

use crate::system::{SystemError, SystemManager};

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Request {
        message: String,
        task_type: Option<TaskType>,
    },
    Status(WorkflowId),
    Stop(WorkflowId),
    List,
    System,
    Quit,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum CommandError {
    #[error("'{command}' needs a task ID")]
    MissingId { command: &'static str },

    #[error("Invalid task ID '{0}'")]
    InvalidId(String),
}

impl Command {
    /// Parse one input line. Blank lines yield `Ok(None)`.
    pub fn parse(line: &str) -> Result<Option<Command>, CommandError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }

        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };

        let command = match word {
            "status" => Command::Status(parse_id("status", rest)?),
            "stop" => Command::Stop(parse_id("stop", rest)?),
            "list" if rest.is_empty() => Command::List,
            "system" if rest.is_empty() => Command::System,
            "quit" | "exit" if rest.is_empty() => Command::Quit,
            _ => match line.split_once(':') {
                Some((prefix, message)) if prefix.trim().parse::<TaskType>().is_ok() => {
                    Command::Request {
                        message: message.trim().to_string(),
                        task_type: prefix.trim().parse().ok(),
                    }
                }
                _ => Command::Request {
                    message: line.to_string(),
                    task_type: None,
                },
            },
        };
        Ok(Some(command))
    }
}

/// Read commands from `input` until EOF or `quit`, writing one JSON line
/// per command to `output`.
pub async fn run<R, W>(system: &SystemManager, input: R, mut output: W) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        let response = match Command::parse(&line) {
            Ok(None) => continue,
            Ok(Some(Command::Quit)) => break,
            Ok(Some(command)) => execute(system, command).await,
            Err(e) => json!({ "error": e.to_string() }),
        };
        output.write_all(response.to_string().as_bytes()).await?;
        output.write_all(b"\n").await?;
        output.flush().await?;
    }
    Ok(())
}

// ---- private helpers ----

fn parse_id(command: &'static str, rest: &str) -> Result<WorkflowId, CommandError> {
    if rest.is_empty() {
        return Err(CommandError::MissingId { command });
    }
    rest.parse()
        .map_err(|_| CommandError::InvalidId(rest.to_string()))
}

async fn execute(system: &SystemManager, command: Command) -> Value {
    let result = match command {
        Command::Request { message, task_type } => system
            .process_request(&message, task_type)
            .await
            .map(|outcome| json!(outcome)),
        Command::Status(id) => system.get_task_status(id).await.map(|run| json!(run)),
        Command::Stop(id) => system
            .stop_task(id)
            .await
            .map(|stopped| json!({ "task_id": id, "stopped": stopped })),
        Command::List => system.list_tasks().await.map(|runs| json!(runs)),
        Command::System => Ok(json!(system.status().await)),
        Command::Quit => Ok(Value::Null),
    };
    result.unwrap_or_else(|e: SystemError| json!({ "error": e.to_string() }))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parses_control_commands() {
        let id = uuid::Uuid::new_v4();
        assert_eq!(
            Command::parse(&format!("status {id}")).unwrap(),
            Some(Command::Status(id))
        );
        assert_eq!(
            Command::parse(&format!("  stop   {id} ")).unwrap(),
            Some(Command::Stop(id))
        );
        assert_eq!(Command::parse("list").unwrap(), Some(Command::List));
        assert_eq!(Command::parse("exit").unwrap(), Some(Command::Quit));
        assert_eq!(Command::parse("   ").unwrap(), None);
    }

    #[test]
    fn bad_ids_are_rejected() {
        assert_eq!(
            Command::parse("status"),
            Err(CommandError::MissingId { command: "status" })
        );
        assert_matches!(Command::parse("stop 42"), Err(CommandError::InvalidId(id)) if id == "42");
    }

    #[test]
    fn task_type_prefix_is_optional() {
        assert_eq!(
            Command::parse("image_generation: a red fox").unwrap(),
            Some(Command::Request {
                message: "a red fox".into(),
                task_type: Some(TaskType::ImageGeneration),
            })
        );
        assert_eq!(
            Command::parse("note: buy milk").unwrap(),
            Some(Command::Request {
                message: "note: buy milk".into(),
                task_type: None,
            })
        );
    }

    #[test]
    fn command_words_with_text_are_requests() {
        assert_eq!(
            Command::parse("list the planets").unwrap(),
            Some(Command::Request {
                message: "list the planets".into(),
                task_type: None,
            })
        );
    }
}
