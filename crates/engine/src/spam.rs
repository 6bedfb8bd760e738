//! Spam gate: scores a message before delivery.
//!
//! The engine only consumes the [`SpamScorer`] trait; [`SpamdClient`] talks
//! the SPAMC protocol to a local spamd. A scorer fault is a local fault and
//! bubbles up, it never silently passes mail through.

use std::{fmt::Display, future::Future, pin::Pin, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};
use tracing::debug;

use crate::message::EmailMessage;

/// Result type for spam scoring operations.
pub type SpamResult<T> = Result<T, SpamError>;

/// Boxed future type for spam scoring operations, enabling object safety.
pub type ScoreFuture<'a> = Pin<Box<dyn Future<Output = SpamResult<SpamVerdict>> + Send + 'a>>;

/// Errors that can occur while scoring a message.
#[derive(Debug)]
pub enum SpamError {
    /// The scoring backend could not be reached.
    Connection(std::io::Error),
    /// The backend answered with something unparseable.
    Protocol(String),
}

impl Display for SpamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpamError::Connection(e) => write!(f, "Spam scorer connection error: {e}"),
            SpamError::Protocol(msg) => write!(f, "Spam scorer protocol error: {msg}"),
        }
    }
}

impl std::error::Error for SpamError {}

/// Outcome of scoring one message. The caller compares the score against
/// its phase threshold; the verdict carries no threshold itself.
#[derive(Debug, Clone)]
pub struct SpamVerdict {
    pub score: f32,
    /// Human-readable report from the backend, kept with quarantined mail.
    pub report: String,
}

/// Scores a message for spam.
pub trait SpamScorer: Send + Sync {
    fn score<'a>(&'a self, message: &'a EmailMessage) -> ScoreFuture<'a>;
}

/// SPAMC `CHECK` client against a spamd instance.
pub struct SpamdClient {
    address: String,
    timeout: Duration,
}

impl SpamdClient {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(address: &str, timeout: Duration) -> Self {
        Self {
            address: address.to_string(),
            timeout,
        }
    }

    async fn check(&self, raw: &str) -> SpamResult<SpamVerdict> {
        let mut stream = TcpStream::connect(&self.address)
            .await
            .map_err(SpamError::Connection)?;

        let request = format!(
            "CHECK SPAMC/1.5\r\nContent-length: {}\r\n\r\n{}",
            raw.len(),
            raw
        );
        stream
            .write_all(request.as_bytes())
            .await
            .map_err(SpamError::Connection)?;
        stream.shutdown().await.map_err(SpamError::Connection)?;

        let mut response = String::new();
        stream
            .read_to_string(&mut response)
            .await
            .map_err(SpamError::Connection)?;

        parse_check_response(&response)
    }
}

impl SpamScorer for SpamdClient {
    fn score<'a>(&'a self, message: &'a EmailMessage) -> ScoreFuture<'a> {
        Box::pin(async move {
            let verdict = timeout(self.timeout, self.check(message.raw()))
                .await
                .map_err(|_| {
                    SpamError::Connection(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "spamd check timed out",
                    ))
                })??;
            debug!(
                score = verdict.score,
                message_id = %message.message_id,
                "message scored"
            );
            Ok(verdict)
        })
    }
}

/// Parses a SPAMC `CHECK` response:
///
/// ```text
/// SPAMD/1.1 0 EX_OK
/// Spam: True ; 7.5 / 5.0
/// ```
fn parse_check_response(response: &str) -> SpamResult<SpamVerdict> {
    let mut lines = response.lines();
    let status = lines
        .next()
        .ok_or_else(|| SpamError::Protocol("empty response".to_string()))?;
    if !status.starts_with("SPAMD/") || !status.contains("EX_OK") {
        return Err(SpamError::Protocol(format!("unexpected status: {status}")));
    }

    for line in lines.by_ref() {
        let Some(value) = line.strip_prefix("Spam:") else {
            continue;
        };
        // "True ; 7.5 / 5.0"
        let score_part = value
            .split(';')
            .nth(1)
            .and_then(|s| s.split('/').next())
            .map(str::trim)
            .ok_or_else(|| SpamError::Protocol(format!("malformed Spam line: {line}")))?;
        let score: f32 = score_part
            .parse()
            .map_err(|_| SpamError::Protocol(format!("unparseable score: {score_part}")))?;
        return Ok(SpamVerdict {
            score,
            report: response.to_string(),
        });
    }

    Err(SpamError::Protocol("missing Spam header".to_string()))
}
