//! Outbound delivery.
//!
//! The engine hands fully rewritten messages to a [`Transport`]; the
//! envelope sender is always a bounce-tracking address, so failures at the
//! next hop come back through the bounce phase. [`SmtpRelay`] is the
//! built-in transport, a minimal SMTP client toward a configured smart
//! host.

use std::{fmt::Display, future::Future, pin::Pin, time::Duration};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    time::timeout,
};
use tracing::{debug, warn};

/// Upper bound on one complete relay submission, connect included. A smart
/// host that stalls past this is treated as unreachable.
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Boxed future type for transport operations, enabling object safety.
pub type SendFuture<'a> = Pin<Box<dyn Future<Output = TransportResult<()>> + Send + 'a>>;

/// Errors that can occur while handing a message to the next hop.
#[derive(Debug)]
pub enum TransportError {
    /// The next hop refused the recipient or the message. Surfaced to the
    /// upstream as a retryable status; the relay never generates its own
    /// bounce reports.
    RecipientRejected(String),
    /// The next hop could not be reached mid-session.
    Connection(std::io::Error),
}

impl Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::RecipientRejected(reply) => {
                write!(f, "Recipient rejected by next hop: {reply}")
            }
            TransportError::Connection(e) => write!(f, "Transport connection error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Delivers one finished message to one recipient.
pub trait Transport: Send + Sync {
    fn send<'a>(
        &'a self,
        envelope_from: &'a str,
        envelope_to: &'a str,
        raw: &'a str,
    ) -> SendFuture<'a>;
}

/// Minimal SMTP client toward a configured smart host.
///
/// Speaks just enough of the protocol for relay submission: HELO, MAIL
/// FROM, RCPT TO, DATA with dot-stuffing, QUIT. TLS and authentication are
/// the smart host's concern.
pub struct SmtpRelay {
    address: String,
    helo_domain: String,
    timeout: Duration,
}

impl SmtpRelay {
    pub fn new(address: &str, helo_domain: &str) -> Self {
        Self {
            address: address.to_string(),
            helo_domain: helo_domain.to_string(),
            timeout: SUBMIT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn submit(
        &self,
        envelope_from: &str,
        envelope_to: &str,
        raw: &str,
    ) -> TransportResult<()> {
        let stream = TcpStream::connect(&self.address)
            .await
            .map_err(TransportError::Connection)?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        expect_reply(&mut reader, 220).await?;

        write_half
            .write_all(format!("HELO {}\r\n", self.helo_domain).as_bytes())
            .await
            .map_err(TransportError::Connection)?;
        expect_reply(&mut reader, 250).await?;

        write_half
            .write_all(format!("MAIL FROM:<{envelope_from}>\r\n").as_bytes())
            .await
            .map_err(TransportError::Connection)?;
        expect_reply(&mut reader, 250).await?;

        write_half
            .write_all(format!("RCPT TO:<{envelope_to}>\r\n").as_bytes())
            .await
            .map_err(TransportError::Connection)?;
        let rcpt_reply = read_reply(&mut reader).await?;
        if !rcpt_reply.starts_with("250") {
            return Err(TransportError::RecipientRejected(rcpt_reply));
        }

        write_half
            .write_all(b"DATA\r\n")
            .await
            .map_err(TransportError::Connection)?;
        expect_reply(&mut reader, 354).await?;

        write_half
            .write_all(dot_stuff(raw).as_bytes())
            .await
            .map_err(TransportError::Connection)?;
        write_half
            .write_all(b"\r\n.\r\n")
            .await
            .map_err(TransportError::Connection)?;
        let data_reply = read_reply(&mut reader).await?;
        if !data_reply.starts_with("250") {
            return Err(TransportError::RecipientRejected(data_reply));
        }

        // failure to QUIT cleanly is not a delivery failure
        let _ = write_half.write_all(b"QUIT\r\n").await;
        Ok(())
    }
}

impl Transport for SmtpRelay {
    fn send<'a>(
        &'a self,
        envelope_from: &'a str,
        envelope_to: &'a str,
        raw: &'a str,
    ) -> SendFuture<'a> {
        Box::pin(async move {
            let submission = timeout(self.timeout, self.submit(envelope_from, envelope_to, raw))
                .await
                .unwrap_or_else(|_| {
                    Err(TransportError::Connection(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "relay submission timed out",
                    )))
                });
            match submission {
                Ok(()) => {
                    debug!(to = %envelope_to, from = %envelope_from, "message relayed");
                    Ok(())
                }
                Err(e) => {
                    warn!(to = %envelope_to, error = %e, "relay submission failed");
                    Err(e)
                }
            }
        })
    }
}

async fn read_reply(
    reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
) -> TransportResult<String> {
    let mut line = String::new();
    loop {
        line.clear();
        let read = reader
            .read_line(&mut line)
            .await
            .map_err(TransportError::Connection)?;
        if read == 0 {
            return Err(TransportError::Connection(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed mid-reply",
            )));
        }
        // multi-line replies use "NNN-"; the last line uses "NNN "
        if line.len() < 4 || line.as_bytes()[3] != b'-' {
            return Ok(line.trim_end().to_string());
        }
    }
}

async fn expect_reply(
    reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
    code: u16,
) -> TransportResult<()> {
    let reply = read_reply(reader).await?;
    if reply.starts_with(&code.to_string()) {
        Ok(())
    } else {
        Err(TransportError::RecipientRejected(reply))
    }
}

/// Escapes leading dots per RFC 5321 §4.5.2.
fn dot_stuff(raw: &str) -> String {
    let mut stuffed = String::with_capacity(raw.len());
    for line in raw.split_inclusive('\n') {
        if line.starts_with('.') {
            stuffed.push('.');
        }
        stuffed.push_str(line);
    }
    stuffed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dot_stuff_escapes_leading_dots() {
        let raw = "Subject: x\r\n\r\n.hidden\r\nnormal\r\n..already\r\n";
        let stuffed = dot_stuff(raw);
        assert!(stuffed.contains("\r\n..hidden\r\n"));
        assert!(stuffed.contains("\r\nnormal\r\n"));
        assert!(stuffed.contains("\r\n...already\r\n"));
    }

    #[test]
    fn test_dot_stuff_leaves_clean_text_alone() {
        let raw = "Subject: x\r\n\r\nbody\r\n";
        assert_eq!(dot_stuff(raw), raw);
    }

    #[tokio::test]
    async fn test_relay_times_out_on_silent_smart_host() {
        // accepts the connection but never sends a greeting
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let relay =
            SmtpRelay::new(&address, "veil.example").with_timeout(Duration::from_millis(50));
        let result = relay
            .send("bounce+1+@veil.example", "me@real.example", "hi\r\n")
            .await;

        match result {
            Err(TransportError::Connection(e)) => {
                assert_eq!(e.kind(), std::io::ErrorKind::TimedOut);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        accept.abort();
    }
}
