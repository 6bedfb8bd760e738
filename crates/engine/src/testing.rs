//! In-memory test doubles for the engine's collaborators.
//!
//! Used by the crate's own tests and available to downstream integration
//! tests that exercise the engine without a network.

use std::sync::Mutex;

use crate::{
    directory::PgpKey,
    encrypt::{EncryptError, Encryptor},
    message::EmailMessage,
    spam::{ScoreFuture, SpamScorer, SpamVerdict},
    transform::{SpfVerdict, SpfVerifier},
    transport::{SendFuture, Transport, TransportError},
};

/// One captured outbound submission.
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub envelope_from: String,
    pub envelope_to: String,
    pub raw: String,
}

/// Transport that records every submission instead of sending it.
/// Recipients listed via [`reject`](Self::reject) are refused.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<SentMessage>>,
    rejected: Mutex<Vec<String>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the transport refuse this recipient from now on.
    pub fn reject(&self, recipient: &str) {
        self.rejected
            .lock()
            .expect("transport lock poisoned")
            .push(recipient.to_string());
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().expect("transport lock poisoned").clone()
    }
}

impl Transport for RecordingTransport {
    fn send<'a>(
        &'a self,
        envelope_from: &'a str,
        envelope_to: &'a str,
        raw: &'a str,
    ) -> SendFuture<'a> {
        Box::pin(async move {
            let rejected = self
                .rejected
                .lock()
                .expect("transport lock poisoned")
                .iter()
                .any(|r| r == envelope_to);
            if rejected {
                return Err(TransportError::RecipientRejected(format!(
                    "550 5.1.1 {envelope_to}: recipient rejected"
                )));
            }
            self.sent
                .lock()
                .expect("transport lock poisoned")
                .push(SentMessage {
                    envelope_from: envelope_from.to_string(),
                    envelope_to: envelope_to.to_string(),
                    raw: raw.to_string(),
                });
            Ok(())
        })
    }
}

/// Scorer that returns a fixed score for every message.
pub struct StubScorer {
    score: f32,
}

impl StubScorer {
    pub fn new(score: f32) -> Self {
        Self { score }
    }
}

impl SpamScorer for StubScorer {
    fn score<'a>(&'a self, _message: &'a EmailMessage) -> ScoreFuture<'a> {
        Box::pin(async move {
            Ok(SpamVerdict {
                score: self.score,
                report: format!("stub score {}", self.score),
            })
        })
    }
}

/// Encryptor that wraps the plaintext in armor markers without real
/// cryptography, or fails when constructed with [`failing`](Self::failing).
pub struct StubEncryptor {
    fail: bool,
}

impl StubEncryptor {
    pub fn new() -> Self {
        Self { fail: false }
    }

    pub fn failing() -> Self {
        Self { fail: true }
    }
}

impl Default for StubEncryptor {
    fn default() -> Self {
        Self::new()
    }
}

impl Encryptor for StubEncryptor {
    fn encrypt(&self, plaintext: &str, _key: &PgpKey) -> Result<String, EncryptError> {
        if self.fail {
            return Err(EncryptError::CannotEncrypt("stub failure".to_string()));
        }
        Ok(format!(
            "-----BEGIN PGP MESSAGE-----\r\n[{} bytes]\r\n-----END PGP MESSAGE-----",
            plaintext.len()
        ))
    }
}

/// Verifier that returns a fixed verdict for every connection.
pub struct StubSpfVerifier {
    verdict: SpfVerdict,
}

impl StubSpfVerifier {
    pub fn new(verdict: SpfVerdict) -> Self {
        Self { verdict }
    }
}

impl SpfVerifier for StubSpfVerifier {
    fn verify(
        &self,
        _client_ip: std::net::IpAddr,
        _helo_domain: &str,
        _envelope_from: &str,
    ) -> SpfVerdict {
        self.verdict
    }
}
