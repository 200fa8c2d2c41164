//! TCP readiness probing.
//!
//! A service counts as ready once its published address accepts a TCP
//! connection. The connection is closed immediately; nothing is sent.

use std::time::Duration;

use tokio::net::TcpStream;
use tracing::debug;

/// Errors returned by [`ReadinessProbe::wait`].
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("{address} did not accept a connection after {attempts} attempts")]
    TimedOut { address: String, attempts: u32 },
}

/// Retry budget for a readiness check.
#[derive(Debug, Clone, Copy)]
pub struct ReadinessProbe {
    attempts: u32,
    interval: Duration,
}

impl ReadinessProbe {
    /// `attempts` counts the initial try; it is clamped to at least one.
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            interval,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Polls `address` until it accepts a connection.
    ///
    /// Returns the number of attempts used. Each connect is bounded by the
    /// interval, and the interval is slept only between attempts.
    pub async fn wait(&self, address: &str) -> Result<u32, ProbeError> {
        for attempt in 1..=self.attempts {
            match tokio::time::timeout(self.interval, TcpStream::connect(address)).await {
                Ok(Ok(stream)) => {
                    drop(stream);
                    debug!("{} accepted a connection on attempt {}", address, attempt);
                    return Ok(attempt);
                }
                Ok(Err(e)) => debug!("{} not ready (attempt {}): {}", address, attempt, e),
                Err(_) => debug!("{} connect timed out (attempt {})", address, attempt),
            }

            if attempt < self.attempts {
                tokio::time::sleep(self.interval).await;
            }
        }

        Err(ProbeError::TimedOut {
            address: address.to_string(),
            attempts: self.attempts,
        })
    }
}

impl Default for ReadinessProbe {
    fn default() -> Self {
        Self::new(11, Duration::from_secs(1))
    }
}
