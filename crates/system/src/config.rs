use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use studio_comfyui::launcher::LaunchConfig;
use studio_comfyui::manager::ComfyUIConfig;
use studio_workflow::manager::WorkflowConfig;

/// Complete runtime configuration, loaded from environment variables.
#[derive(Debug, Clone, Default)]
pub struct StudioConfig {
    pub comfyui: ComfyUIConfig,
    pub workflow: WorkflowConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}={value:?} is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

impl StudioConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                          | Default        |
    /// |----------------------------------|----------------|
    /// | `COMFYUI_HOST`                   | `127.0.0.1`    |
    /// | `COMFYUI_PORT`                   | `8188`         |
    /// | `COMFYUI_PATH`                   | unset (attach) |
    /// | `COMFYUI_MANAGED`                | `true` when `COMFYUI_PATH` is set |
    /// | `COMFYUI_PYTHON`                 | `python3`      |
    /// | `COMFYUI_EXTRA_ARGS`             | empty          |
    /// | `COMFYUI_STARTUP_TIMEOUT_SECS`   | `30`           |
    /// | `COMFYUI_REQUEST_TIMEOUT_SECS`   | `60`           |
    /// | `STUDIO_WORKFLOWS_DIR`           | `workflows`    |
    /// | `STUDIO_TEMPLATES_DIR`           | `templates`    |
    /// | `STUDIO_OUTPUT_DIR`              | `output`       |
    /// | `STUDIO_MAX_CONCURRENT`          | `5`            |
    /// | `STUDIO_EXECUTION_TIMEOUT_SECS`  | `300` (`0` disables) |
    /// | `STUDIO_RETENTION_HOURS`         | `24`           |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable
    /// source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let comfy_defaults = ComfyUIConfig::default();
        let workflow_defaults = WorkflowConfig::default();

        let host = lookup("COMFYUI_HOST").unwrap_or(comfy_defaults.host);
        let port: u16 = parse(&lookup, "COMFYUI_PORT", comfy_defaults.port)?;

        let install_dir = lookup("COMFYUI_PATH")
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);
        let managed: bool = parse(&lookup, "COMFYUI_MANAGED", install_dir.is_some())?;
        let launch = match (managed, install_dir) {
            (true, Some(install_dir)) => Some(LaunchConfig {
                install_dir,
                python: lookup("COMFYUI_PYTHON").unwrap_or_else(|| "python3".into()),
                extra_args: lookup("COMFYUI_EXTRA_ARGS")
                    .map(|args| args.split_whitespace().map(str::to_string).collect())
                    .unwrap_or_default(),
            }),
            (true, None) => {
                return Err(ConfigError::Invalid {
                    var: "COMFYUI_MANAGED",
                    value: "true".into(),
                    reason: "COMFYUI_PATH must be set to launch ComfyUI".into(),
                })
            }
            (false, _) => None,
        };

        let startup_secs: u64 = parse(
            &lookup,
            "COMFYUI_STARTUP_TIMEOUT_SECS",
            comfy_defaults.startup_timeout.as_secs(),
        )?;
        let request_secs: u64 = parse(
            &lookup,
            "COMFYUI_REQUEST_TIMEOUT_SECS",
            comfy_defaults.request_timeout.as_secs(),
        )?;

        let max_concurrent: usize = parse(
            &lookup,
            "STUDIO_MAX_CONCURRENT",
            workflow_defaults.max_concurrent,
        )?;
        if max_concurrent == 0 {
            return Err(ConfigError::Invalid {
                var: "STUDIO_MAX_CONCURRENT",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }

        let timeout_secs: u64 = parse(
            &lookup,
            "STUDIO_EXECUTION_TIMEOUT_SECS",
            workflow_defaults.execution_timeout.as_secs(),
        )?;
        let retention_hours: u64 = parse(
            &lookup,
            "STUDIO_RETENTION_HOURS",
            workflow_defaults.retention.as_secs() / 3600,
        )?;
        let retention_secs = retention_hours
            .checked_mul(3600)
            .ok_or_else(|| ConfigError::Invalid {
                var: "STUDIO_RETENTION_HOURS",
                value: retention_hours.to_string(),
                reason: "too large".into(),
            })?;

        let dir = |var: &str, default: PathBuf| lookup(var).map(PathBuf::from).unwrap_or(default);

        Ok(Self {
            comfyui: ComfyUIConfig {
                host,
                port,
                launch,
                startup_timeout: Duration::from_secs(startup_secs),
                request_timeout: Duration::from_secs(request_secs),
                ..comfy_defaults
            },
            workflow: WorkflowConfig {
                workflows_dir: dir("STUDIO_WORKFLOWS_DIR", workflow_defaults.workflows_dir),
                templates_dir: dir("STUDIO_TEMPLATES_DIR", workflow_defaults.templates_dir),
                output_dir: dir("STUDIO_OUTPUT_DIR", workflow_defaults.output_dir),
                max_concurrent,
                execution_timeout: Duration::from_secs(timeout_secs),
                retention: Duration::from_secs(retention_secs),
                cancel_grace: workflow_defaults.cancel_grace,
            },
        })
    }
}

fn parse<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
            value,
        }),
    }
}
