//! Starting, probing, and stopping the ComfyUI server process.
//!
//! [`ServerProcess::spawn`] runs `<python> main.py --listen <host> --port
//! <port>` inside the install directory and forwards its output to the log.
//! [`wait_until_ready`] polls the HTTP API at a fixed interval until it
//! answers, the process exits, or the startup timeout elapses.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::api::ComfyUIApi;

/// How to start a local ComfyUI server.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// ComfyUI checkout containing `main.py`.
    pub install_dir: PathBuf,
    /// Python interpreter (default `python3`).
    pub python: String,
    /// Extra arguments appended after `--listen`/`--port`.
    pub extra_args: Vec<String>,
}

/// A running ComfyUI child process.
#[derive(Debug)]
pub struct ServerProcess {
    child: Child,
    log_tasks: Vec<JoinHandle<()>>,
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("ComfyUI not found: {} does not exist", .0.display())]
    NotInstalled(PathBuf),

    #[error("Failed to spawn ComfyUI: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("ComfyUI exited during startup ({0})")]
    Exited(ExitStatus),

    #[error("Timed out after {elapsed:?} waiting for ComfyUI at {url}")]
    StartupTimeout { url: String, elapsed: Duration },
}

impl ServerProcess {
    /// Spawn the server. Fails fast when `main.py` is missing.
    pub fn spawn(config: &LaunchConfig, host: &str, port: u16) -> Result<Self, LaunchError> {
        let entrypoint = config.install_dir.join("main.py");
        if !entrypoint.is_file() {
            return Err(LaunchError::NotInstalled(entrypoint));
        }

        let port_arg = port.to_string();
        let mut cmd = Command::new(&config.python);
        cmd.arg("main.py")
            .args(["--listen", host, "--port", port_arg.as_str()])
            .args(&config.extra_args)
            .current_dir(&config.install_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(LaunchError::Spawn)?;

        tracing::info!(
            pid = ?child.id(),
            install_dir = %config.install_dir.display(),
            host,
            port,
            "Spawned ComfyUI server",
        );

        let mut log_tasks = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            log_tasks.push(tokio::spawn(forward_output(stdout, "stdout")));
        }
        if let Some(stderr) = child.stderr.take() {
            log_tasks.push(tokio::spawn(forward_output(stderr, "stderr")));
        }

        Ok(Self { child, log_tasks })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Exit status if the process has already exited.
    pub fn try_exited(&mut self) -> Option<ExitStatus> {
        self.child.try_wait().ok().flatten()
    }

    /// Ask the process to terminate, then kill it if it is still alive after
    /// `grace`.
    pub async fn shutdown(mut self, grace: Duration) {
        if let Some(status) = self.try_exited() {
            tracing::info!(%status, "ComfyUI server already exited");
            self.abort_log_tasks();
            return;
        }

        let terminated = self.child.id().is_some_and(send_terminate);
        if terminated {
            match tokio::time::timeout(grace, self.child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::info!(%status, "ComfyUI server stopped");
                    self.abort_log_tasks();
                    return;
                }
                Ok(Err(e)) => tracing::warn!(error = %e, "Failed waiting for ComfyUI to exit"),
                Err(_) => tracing::warn!(
                    grace_secs = grace.as_secs(),
                    "ComfyUI did not exit after SIGTERM, killing",
                ),
            }
        }

        if let Err(e) = self.child.kill().await {
            tracing::error!(error = %e, "Failed to kill ComfyUI server");
        } else {
            tracing::info!("ComfyUI server killed");
        }
        self.abort_log_tasks();
    }

    fn abort_log_tasks(&mut self) {
        for task in self.log_tasks.drain(..) {
            task.abort();
        }
    }
}

#[cfg(unix)]
fn send_terminate(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: kill(2) has no memory-safety preconditions; the pid belongs to
    // a child we have not yet reaped.
    unsafe { libc::kill(pid, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
fn send_terminate(_pid: u32) -> bool {
    false
}

async fn forward_output<R: AsyncRead + Unpin>(stream: R, name: &'static str) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(target: "comfyui_server", stream = name, "{line}");
    }
}

/// Poll `GET /system_stats` every `interval` until the server answers.
///
/// When `process` is given, an early exit of the child aborts the wait
/// with [`LaunchError::Exited`] instead of running out the clock.
pub async fn wait_until_ready(
    api: &ComfyUIApi,
    timeout: Duration,
    interval: Duration,
    mut process: Option<&mut ServerProcess>,
) -> Result<(), LaunchError> {
    let start = Instant::now();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match api.system_stats().await {
            Ok(_) => {
                tracing::info!(
                    attempt,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "ComfyUI is ready",
                );
                return Ok(());
            }
            Err(e) => tracing::debug!(attempt, error = %e, "ComfyUI not ready yet"),
        }

        if let Some(status) = process.as_deref_mut().and_then(ServerProcess::try_exited) {
            return Err(LaunchError::Exited(status));
        }

        if start.elapsed() + interval > timeout {
            return Err(LaunchError::StartupTimeout {
                url: api.api_url().to_string(),
                elapsed: start.elapsed(),
            });
        }
        tokio::time::sleep(interval).await;
    }
}
