//! Exponential-backoff reconnection for the ComfyUI WebSocket.
//!
//! When the listener's connection drops, [`reconnect_loop`] keeps retrying
//! with increasing delays until the connection is restored, the attempt
//! budget runs out, or the [`CancellationToken`] is triggered.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::client::{ComfyUIClient, ComfyUIConnection};

/// Tunable parameters for the backoff strategy.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
    /// Give up after this many attempts; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

/// Why [`reconnect_loop`] stopped without a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectAborted {
    Cancelled,
    GaveUp { attempts: u32 },
}

/// Next backoff delay, clamped to [`ReconnectConfig::max_delay`].
pub fn next_delay(current: Duration, config: &ReconnectConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.multiplier) as u64;
    Duration::from_millis(next_ms).min(config.max_delay)
}

/// Reconnect with exponential backoff.
pub async fn reconnect_loop(
    client: &ComfyUIClient,
    config: &ReconnectConfig,
    cancel: &CancellationToken,
) -> Result<ComfyUIConnection, ReconnectAborted> {
    let mut delay = config.initial_delay;
    let mut attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(ReconnectAborted::Cancelled);
        }
        if config.max_attempts.is_some_and(|max| attempt >= max) {
            tracing::error!(
                client_id = %client.client_id(),
                attempts = attempt,
                "Giving up reconnecting to ComfyUI",
            );
            return Err(ReconnectAborted::GaveUp { attempts: attempt });
        }

        attempt += 1;
        tracing::info!(
            client_id = %client.client_id(),
            attempt,
            "Reconnecting to ComfyUI",
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(ReconnectAborted::Cancelled),
            result = client.connect() => match result {
                Ok(conn) => {
                    tracing::info!(attempt, "Reconnected to ComfyUI");
                    return Ok(conn);
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Reconnect attempt {attempt} failed",
                    );
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(ReconnectAborted::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }

        delay = next_delay(delay, config);
    }
}
