use std::{io, time::Duration};

use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::{endpoint::Endpoint, error::TransportError};

/// Delay schedule between failed dial attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub factor: u32,
    /// Give up after this many failed attempts. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(50),
            max: Duration::from_secs(2),
            factor: 2,
            max_attempts: None,
        }
    }
}

impl Backoff {
    /// Retry with no delay at all.
    pub fn immediate() -> Self {
        Self {
            initial: Duration::ZERO,
            max: Duration::ZERO,
            factor: 1,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Delay to wait after the `attempt`-th failure (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let growth = self.factor.saturating_pow(attempt.saturating_sub(1));
        self.initial.saturating_mul(growth).min(self.max)
    }

    fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

/// Dials one endpoint, retrying until the socket connects.
#[derive(Debug, Clone)]
pub struct Connector {
    endpoint: Endpoint,
    backoff: Backoff,
}

impl Connector {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    /// Connects, retrying per the backoff. With unbounded attempts this only
    /// returns once a socket is established.
    pub async fn dial(&self) -> Result<TcpStream, TransportError> {
        let addr = self.endpoint.socket_addr();
        let mut attempts = 0u32;

        loop {
            attempts = attempts.saturating_add(1);
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    info!(%addr, attempts, "connected");
                    return Ok(stream);
                }
                Err(source) => {
                    if self.backoff.exhausted(attempts) {
                        return Err(TransportError::Dial {
                            addr,
                            attempts,
                            source,
                        });
                    }
                    self.log_failure(attempts, &source);
                    tokio::time::sleep(self.backoff.delay_for(attempts)).await;
                }
            }
        }
    }

    /// Dials and passes the socket to `on_connect` exactly once.
    pub async fn dial_with<F, T>(&self, on_connect: F) -> Result<T, TransportError>
    where
        F: FnOnce(TcpStream) -> T,
    {
        let stream = self.dial().await?;
        Ok(on_connect(stream))
    }

    fn log_failure(&self, attempts: u32, error: &io::Error) {
        if attempts == 1 {
            warn!(addr = %self.endpoint, %error, "dial failed, retrying");
        } else {
            debug!(addr = %self.endpoint, attempts, %error, "dial retry failed");
        }
    }
}
